pub mod error;
pub mod hook;
pub mod requests;
pub mod responses;


pub use error::{ErrorKind, Result, SkeinError};
pub use hook::Hook;
pub use requests::{Request, RequestId, TaskArgs, TaskName};
pub use responses::{Response, ResponseError, TaskResult};
