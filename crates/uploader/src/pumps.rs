//! Background tasks behind [`WsClient`](crate::WsClient).

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;

use std::collections::HashMap;
use std::sync::Arc;

use chunkup_protocol::envelope::Message;
use tokio::sync::{Mutex, oneshot};

/// Requests awaiting a response, keyed by request id.
pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;
