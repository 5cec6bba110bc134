pub mod client;
pub mod method;
pub mod request;
pub mod response;
pub mod session;
pub mod transport;

pub use client::HttpExecutor;
pub use method::HttpMethod;
pub use request::Request;
pub use response::Response;
pub use session::{Cookie, SessionStore};
pub use transport::{RetryPolicy, RetryingTransport, ReqwestSender, Sender};
