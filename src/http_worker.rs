//! Compute workers: a single-threaded request/response loop over one pair
//! of in-memory queues. Requests arrive with an envelope naming the client
//! they came from; the worker forwards the envelope untouched and never
//! routes by it.

use std::io;
use std::path::PathBuf;

use log::{error, info, warn};

use crate::datapath::{Datapath, DatapathError, OpResult, Packet, QDesc};
use crate::protocol::ParseResult;
use crate::{metrics, protocol, response};

/// Record shared with connection workers: where to push requests and where
/// replies come out. Immutable once the pools are up.
#[derive(Debug, Clone, Copy)]
pub struct ComputeHandle {
    pub id: usize,
    pub in_qd: QDesc,
    pub out_qd: QDesc,
}

pub struct HttpWorker {
    pub id: usize,
    pub in_qd: QDesc,
    pub out_qd: QDesc,
    pub doc_root: PathBuf,
    pub datapath: Datapath,
}

impl HttpWorker {
    pub fn run(mut self) -> Result<(), DatapathError> {
        info!("compute worker {} up", self.id);
        loop {
            let qt = self.datapath.pop(self.in_qd)?;
            let comp = self.datapath.wait(qt)?;
            let pkt = match comp.result {
                OpResult::Popped(pkt) => pkt,
                OpResult::Failed(errno) => {
                    error!("compute worker {}: input queue failed: {errno}", self.id);
                    return Err(DatapathError::Io(io::Error::from_raw_os_error(errno)));
                }
                // Only pops are submitted on the input queue.
                _ => continue,
            };
            let origin = pkt.origin;

            match protocol::parse(&pkt.payload) {
                ParseResult::Error => {
                    warn!("compute worker {} got malformed request", self.id);
                    drop(pkt);
                    metrics::inc_bad_requests();
                    self.reply(response::bad_request(), origin)?;
                }
                ParseResult::Incomplete => {
                    warn!(
                        "compute worker {} got incomplete request; partial requests are unsupported",
                        self.id
                    );
                    metrics::inc_partial_dropped();
                }
                ParseResult::Complete(req) => {
                    let body = response::build(&req.url, &self.doc_root);
                    drop(pkt);
                    metrics::inc_compute_served(self.id);
                    self.reply(body, origin)?;
                }
            }
        }
    }

    fn reply(&mut self, payload: Vec<u8>, origin: Option<QDesc>) -> Result<(), DatapathError> {
        let pkt = Packet { payload, origin };
        let qt = self.datapath.push(self.out_qd, pkt)?;
        self.datapath.wait(qt)?;
        Ok(())
    }
}
