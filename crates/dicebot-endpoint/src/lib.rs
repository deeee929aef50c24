//! Protocol endpoint supervision for the dicebot gateway.
//!
//! Launches and watches protocol client processes, drives their QR-code and
//! device-lock login flow from log output, and keeps every enabled endpoint
//! connected through an independent reconnect loop.
//!
//! ```rust
//! use dicebot_endpoint::{decode_login_line, LoginLineEvent};
//!
//! let event = decode_login_line("[WARNING]: 账号已开启设备锁，请前往 -> https://verify.example/a <- 验证");
//! assert_eq!(
//!     event,
//!     Some(LoginLineEvent::DeviceLockRedirect {
//!         url: "https://verify.example/a".to_string()
//!     })
//! );
//! ```

pub mod endpoint_bootstrap;
pub mod endpoint_connector;
pub mod endpoint_contract;
pub mod endpoint_device_identity;
pub mod endpoint_gateway;
pub mod endpoint_login_flow;
pub mod endpoint_port_allocator;
pub mod endpoint_reconnect;
pub mod endpoint_registry;
pub mod endpoint_session;
pub mod endpoint_state;
pub mod endpoint_supervisor;

pub use endpoint_bootstrap::*;
pub use endpoint_connector::*;
pub use endpoint_contract::*;
pub use endpoint_device_identity::*;
pub use endpoint_gateway::*;
pub use endpoint_login_flow::*;
pub use endpoint_port_allocator::*;
pub use endpoint_reconnect::*;
pub use endpoint_registry::*;
pub use endpoint_session::*;
pub use endpoint_state::*;
pub use endpoint_supervisor::*;
