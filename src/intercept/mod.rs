//! Request interception: route GET requests through cache strategies and
//! synthesize offline responses when the network is gone.

mod cache;
mod control;
mod interceptor;
mod routes;
mod transport;
mod types;

pub use cache::{CacheNames, Namespace, ResponseCache};
pub use control::{ControlMessage, ControlReply};
pub use interceptor::{Interceptor, Lifecycle, PrecacheReport, OFFLINE_STATUS};
pub use routes::Router;
pub use transport::{ReqwestTransport, Transport};
pub use types::{FetchRequest, FetchResponse, InterceptedResponse, Resolution, RouteClass};
