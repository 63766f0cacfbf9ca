pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod escalation;
pub mod exec;
pub mod forwarder;
pub mod nginx;
pub mod registry;
pub mod session;
pub mod shell;
pub mod transport;
pub mod update;

pub use dedup::DedupCache;
pub use dispatcher::{DispatchSettings, Dispatcher};
pub use error::AgentError;
pub use escalation::{EscalationPolicy, EscalationStage};
pub use forwarder::{BatchPolicy, ForwardingRegistry};
pub use nginx::{NGINX_DOWN, NGINX_OK, NginxControl, SystemNginx};
pub use registry::SessionRegistry;
pub use session::{Session, SessionInfo, SessionOptions};
pub use shell::{default_shell, resolve_shell};
pub use transport::{ChannelTransport, Inbound, Outbound, Publication, Transport};
pub use update::{HttpUpdater, Updater};
