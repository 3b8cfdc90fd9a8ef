use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use skein_common::protocol::error::Result;
use skein_common::protocol::{Request, RequestId, Response, TaskResult};
use std::future::Future;
use std::marker::PhantomData;

/// What a handler produces: an inline result, a stream location, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    pub result: Option<TaskResult>,
    pub stream_url: Option<String>,
}

impl TaskOutput {
    pub fn value(result: TaskResult) -> Self {
        Self {
            result: Some(result),
            stream_url: None,
        }
    }

    pub fn stream(url: impl Into<String>) -> Self {
        Self {
            result: None,
            stream_url: Some(url.into()),
        }
    }

    pub fn into_response(self, id: impl Into<RequestId>) -> Response {
        Response {
            id: id.into(),
            result: self.result,
            stream_url: self.stream_url,
            error: None,
        }
    }
}

/// Runs one task.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<TaskOutput>;
}

/// Adapts a closure over the raw request.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutput>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<TaskOutput> {
        (self.f)(request).await
    }
}

/// Adapts a closure over typed arguments and a serializable result.
///
/// Arguments are decoded from the request right before the closure runs,
/// so a shape mismatch fails only this task with `malformed_request`.
pub struct TypedHandler<A, O, F> {
    f: F,
    _marker: PhantomData<fn(A) -> O>,
}

impl<A, O, F> TypedHandler<A, O, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A, O, F, Fut> TaskHandler for TypedHandler<A, O, F>
where
    A: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<TaskOutput> {
        let args: A = request.unmarshal_args()?;
        let output = (self.f)(args).await?;
        Ok(TaskOutput::value(serde_json::to_value(output)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use skein_common::protocol::{ErrorKind, SkeinError};

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[derive(Serialize)]
    struct Sum {
        sum: i64,
    }

    #[tokio::test]
    async fn test_typed_handler_decodes_and_encodes() {
        let handler = TypedHandler::new(|args: AddArgs| async move { Ok(Sum { sum: args.a + args.b }) });
        let output = handler
            .handle(Request::new("add", json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(output, TaskOutput::value(json!({"sum": 5})));
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_bad_args() {
        let handler = TypedHandler::new(|args: AddArgs| async move { Ok(Sum { sum: args.a }) });
        let err = handler
            .handle(Request::new("add", json!({"a": "two"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRequest);
    }

    #[tokio::test]
    async fn test_fn_handler_passes_errors_through() {
        let handler = FnHandler::new(|_req: Request| async move {
            Err::<TaskOutput, _>(SkeinError::Provider("unit not found".into()))
        });
        let err = handler.handle(Request::new("svc", json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderError);
    }

    #[test]
    fn test_output_into_response() {
        let response = TaskOutput::stream("unix:///tmp/s.sock").into_response("r1");
        assert_eq!(response, Response::stream("r1", "unix:///tmp/s.sock"));
    }
}
