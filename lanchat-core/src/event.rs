//! Events published to the presentation shell.

use serde::Serialize;

use crate::channel::Message;
use crate::protocol::{MessageId, TransferId};
use crate::registry::PeerRecord;
use crate::transfer::FileTransfer;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    PeerJoined(PeerRecord),
    PeerUpdated(PeerRecord),
    PeerLeft(PeerRecord),
    MessageReceived(Message),
    MessageDelivered { message_id: MessageId },
    MessageFailed { message_id: MessageId, reason: String },
    /// A peer started sending us a file.
    TransferOffered(FileTransfer),
    TransferProgress {
        transfer_id: TransferId,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    TransferCompleted(FileTransfer),
    TransferFailed { transfer_id: TransferId, reason: String },
    /// The sending peer abandoned an incoming transfer.
    TransferCancelled { transfer_id: TransferId },
}
