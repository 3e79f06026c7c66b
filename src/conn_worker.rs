//! Connection workers: each owns one listening endpoint and drives every
//! connection accepted on it through one request/response cycle,
//! multiplexing cooperatively via a single wait_any per loop iteration.
//!
//! Per connection, reads are strictly serialized: the next pop on a client
//! is submitted only after its response push has completed. The listening
//! descriptor always has exactly one accept in flight.

use std::io;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::LISTEN_BACKLOG;
use crate::datapath::{
    is_terminal, Datapath, DatapathError, OpResult, Packet, QDesc, QToken,
};
use crate::http_worker::ComputeHandle;
use crate::policy::Policy;
use crate::protocol::ParseResult;
use crate::supervisor::Registry;
use crate::{metrics, protocol, response, signals};

pub struct ConnWorker {
    pub id: usize,
    pub addr: SocketAddrV4,
    pub split: bool,
    pub policy: Policy,
    pub doc_root: PathBuf,
    pub compute: Arc<Vec<ComputeHandle>>,
    pub registry: Arc<Registry>,
    pub datapath: Datapath,
}

impl ConnWorker {
    pub fn run(mut self) -> Result<(), DatapathError> {
        let lqd = self.datapath.socket()?;
        self.registry.add_listener(lqd);
        signals::register_listener(self.datapath.table().socket_fd(lqd)?);
        self.datapath.bind(lqd, self.addr)?;
        self.datapath.listen(lqd, LISTEN_BACKLOG)?;
        info!("connection worker {} listening on {}", self.id, self.addr);

        let mut tokens: Vec<QToken> = vec![self.datapath.accept(lqd)?];
        // Compute output queues this worker has an outstanding pop on.
        let mut pending_replies: Vec<QDesc> = Vec::new();
        let mut num_rcvd: u64 = 0;

        loop {
            let (idx, comp) = self.datapath.wait_any(&tokens)?;
            tokens.swap_remove(idx);

            match comp.result {
                OpResult::Accepted(client) => {
                    metrics::inc_conns_accepted();
                    debug!("accepted a new connection on {:?}", comp.qd);
                    // Arm the first read, then keep the listener accepting.
                    tokens.push(self.datapath.pop(client)?);
                    tokens.push(self.datapath.accept(lqd)?);
                }
                OpResult::Popped(pkt) => {
                    if let Some(slot) = pending_replies.iter().position(|&qd| qd == comp.qd) {
                        pending_replies.swap_remove(slot);
                        self.forward_reply(comp.qd, pkt, &mut tokens)?;
                    } else {
                        num_rcvd += 1;
                        metrics::inc_requests_received();
                        if num_rcvd % 100 == 0 {
                            info!(
                                "connection worker {}: received {} requests",
                                self.id, num_rcvd
                            );
                        }
                        if self.split {
                            self.dispatch(comp.qd, pkt, num_rcvd, &mut tokens, &mut pending_replies)?;
                        } else {
                            self.serve_inline(comp.qd, pkt, &mut tokens)?;
                        }
                    }
                }
                OpResult::Failed(errno) if is_terminal(errno) => {
                    debug!("connection {:?} went away ({errno})", comp.qd);
                    self.datapath.close(comp.qd);
                }
                OpResult::Failed(errno) => {
                    return Err(DatapathError::Io(io::Error::from_raw_os_error(errno)));
                }
                OpResult::Pushed => {
                    // Pushes are waited on synchronously and never enter the set.
                }
            }
        }
    }

    /// Split mode: hand the raw request to a compute worker with the client
    /// descriptor in the envelope, then start listening for that worker's
    /// reply. The client stays quiescent until its response goes out.
    fn dispatch(
        &mut self,
        client: QDesc,
        pkt: Packet,
        num_rcvd: u64,
        tokens: &mut Vec<QToken>,
        pending_replies: &mut Vec<QDesc>,
    ) -> Result<(), DatapathError> {
        let widx = self
            .policy
            .select(self.id, num_rcvd, &pkt.payload, self.compute.len());
        let worker = self.compute[widx];
        debug!(
            "connection worker {} routing request to compute worker {}",
            self.id, widx
        );

        let qt = self
            .datapath
            .push(worker.in_qd, Packet::with_origin(pkt.payload, client))?;
        self.datapath.wait(qt)?;

        tokens.push(self.datapath.pop(worker.out_qd)?);
        pending_replies.push(worker.out_qd);
        Ok(())
    }

    /// A compute reply arrived: recover the client from the envelope and
    /// deliver the payload.
    fn forward_reply(
        &mut self,
        reply_qd: QDesc,
        pkt: Packet,
        tokens: &mut Vec<QToken>,
    ) -> Result<(), DatapathError> {
        let Some(client) = pkt.origin else {
            return Err(DatapathError::MissingEnvelope(reply_qd));
        };
        debug!("received response for {client:?} on {reply_qd:?}");
        self.respond(client, pkt.payload, tokens)
    }

    /// Joined mode: parse and answer on this thread.
    fn serve_inline(
        &mut self,
        client: QDesc,
        pkt: Packet,
        tokens: &mut Vec<QToken>,
    ) -> Result<(), DatapathError> {
        match protocol::parse(&pkt.payload) {
            ParseResult::Error => {
                warn!("connection worker {} got malformed request", self.id);
                drop(pkt);
                metrics::inc_bad_requests();
                self.respond(client, response::bad_request(), tokens)
            }
            ParseResult::Incomplete => {
                warn!(
                    "connection worker {} got incomplete request; partial requests are unsupported",
                    self.id
                );
                metrics::inc_partial_dropped();
                Ok(())
            }
            ParseResult::Complete(req) => {
                let body = response::build(&req.url, &self.doc_root);
                drop(pkt);
                self.respond(client, body, tokens)
            }
        }
    }

    /// Push one response and, once it is fully out, re-arm the client for
    /// its next request.
    fn respond(
        &mut self,
        client: QDesc,
        payload: Vec<u8>,
        tokens: &mut Vec<QToken>,
    ) -> Result<(), DatapathError> {
        let qt = self.datapath.push(client, Packet::new(payload))?;
        match self.datapath.wait(qt)?.result {
            OpResult::Pushed => {
                metrics::inc_responses_sent();
                tokens.push(self.datapath.pop(client)?);
                Ok(())
            }
            OpResult::Failed(errno) if is_terminal(errno) => {
                debug!("client {client:?} went away before its response ({errno})");
                self.datapath.close(client);
                Ok(())
            }
            OpResult::Failed(errno) => {
                Err(DatapathError::Io(io::Error::from_raw_os_error(errno)))
            }
            _ => Ok(()),
        }
    }
}
