pub mod error;
pub mod requests;
pub mod responses;


pub use error::{Result, RpcError};
pub use requests::{MethodName, RequestId, RequestIdSource, RpcParams, RpcRequest};
pub use responses::{FaultBody, RpcResponse, RpcResult};
