//! `proxycore`: a readiness-driven transparent proxy core with on-the-fly
//! TLS certificate forgery.
//!
//! The core loop ([`proxy::BaseProxy`]) relates CXes ([`hostcx::HostCx`])
//! on two logical sides through a single-threaded readiness multiplexer
//! ([`poller::Poller`]); [`master::MasterProxy`] dispatches many such
//! sub-proxies over one shared poller, and [`receiver::ThreadedReceiver`]
//! feeds them from a dedicated accept/datagram thread that recovers
//! transparent-redirect original-destination metadata. [`certstore`] and
//! [`com::TlsCom`] provide the certificate-forgery/MITM layer: a spoofed
//! leaf certificate is minted per original-destination SNI and served from
//! a local CA.

pub mod certstore;
pub mod clienthello;
pub mod com;
pub mod config;
pub mod error;
pub mod hostcx;
pub mod master;
pub mod poller;
pub mod proxy;
pub mod receiver;
pub mod sockflow;
pub mod vars;

pub use config::{ProxyConfig, TlsConfig};
pub use error::ProxyError;
pub use hostcx::HostCx;
pub use master::MasterProxy;
pub use poller::{Mask, Poller};
pub use proxy::{BaseProxy, CxSlot};
pub use receiver::{RedirectMap, ThreadedReceiver, WorkItem};
pub use vars::Side;
