pub use crate::config::Config;
pub use crate::mailbox::{Mailbox, MAX_MBOX_SIZE, MBOX_INITIAL_SIZE};
pub use crate::process::{Body, Pid, ProcessInfo, SpawnError, State, Step, HOST_PID, MAX_PROCESS};
pub use crate::router::{Dispatcher, Exchange, Handler, RequestCallback, RequestQueue};
pub use crate::runtime::{Ctx, HostCallback, Runtime};
pub use crate::store::Store;
pub use crate::value::{self, Value};

pub use crate::net::identity::{identity_of, LongTermKey};
pub use crate::net::peer::{Listener, Peer, Peerx};
pub use crate::net::proto::{builtin_registry, Protocol, ProtocolRegistry, Wire};
pub use crate::net::support::{ErrorType, NetworkError, NetworkResult};
