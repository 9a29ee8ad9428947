//! Local ICMP echo responder.
//!
//! Echo requests never reach the relay; the reply is synthesized right
//! here and written back to the TUN. Every other ICMP type is dropped.

use crate::packet::{build_icmp_echo_reply, IcmpInfo};
use bytes::BytesMut;
use tokio::sync::mpsc;
use tracing::{trace, warn};

pub const ICMP_ECHO_REQUEST: u8 = 8;

pub struct IcmpResponder {
    tun_tx: mpsc::Sender<BytesMut>,
}

impl IcmpResponder {
    pub fn new(tun_tx: mpsc::Sender<BytesMut>) -> Self {
        Self { tun_tx }
    }

    pub async fn handle_packet(&self, info: &IcmpInfo, raw: &[u8]) {
        if info.icmp_type != ICMP_ECHO_REQUEST {
            trace!("ICMP type {} dropped", info.icmp_type);
            return;
        }

        let Some(reply) = build_icmp_echo_reply(raw) else {
            trace!("Malformed echo request dropped");
            return;
        };

        trace!("Echo reply: id={} seq={}", info.ident, info.seq_no);
        if self.tun_tx.send(BytesMut::from(&reply[..])).await.is_err() {
            warn!("TUN channel closed, echo reply dropped");
        }
    }
}
