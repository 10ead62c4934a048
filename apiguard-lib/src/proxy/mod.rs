pub mod client_pool;
pub mod context;
pub mod cookies;
pub mod core;
pub mod forwarding;
pub mod http_result;
pub mod reauth;
pub mod report;
pub mod server;
pub mod synthetic_response;

pub use client_pool::ClientPool;
pub use context::ProxyContext;
pub use self::core::CoreProxy;
pub use reauth::{LoginClient, ReauthError, SingleFlight};
pub use report::{spawn_report_logger, ProxyProcReport, RequestCounter, RequestInfo};
pub use server::{run, ServerOptions, ServiceRouter};
