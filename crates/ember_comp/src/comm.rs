//! Asynchronous rank message layer.
//!
//! Multi-rank composition follows the async message-layer model: each rank
//! owns an endpoint, pushes partial tiles to the compositing rank's inbox,
//! and a gather thread on that rank drains the inbox through the reducer
//! into the tile compositor. Ranks here are in-process endpoints over
//! channels; a cluster transport would slot in behind the same messages.
//!
//! An unreachable rank is handled by a wall-clock deadline on the gather
//! thread: if the frame has not completed when the deadline expires, the
//! frame is cancelled with a timeout reason, distinguishable from a user
//! cancel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use ember_fb::{CancelReason, SyncEvent, Tile};

use crate::compositor::TileCompositor;
use crate::reduce::TileReducer;

/// Messages exchanged between rank endpoints.
pub enum TileMessage {
    /// One rank's partial tile for a shared region.
    WriteTile(Box<Tile>),
    /// Abort the in-flight frame everywhere.
    CancelFrame(CancelReason),
}

/// One rank's view of the cluster.
pub struct CommLayer {
    rank: u32,
    peers: Vec<Sender<TileMessage>>,
    inbox: Receiver<TileMessage>,
}

impl CommLayer {
    /// Build an in-process cluster of `num_ranks` connected endpoints.
    pub fn local_cluster(num_ranks: u32) -> Vec<CommLayer> {
        let channels: Vec<(Sender<TileMessage>, Receiver<TileMessage>)> =
            (0..num_ranks).map(|_| unbounded()).collect();
        let peers: Vec<Sender<TileMessage>> = channels.iter().map(|(s, _)| s.clone()).collect();

        channels
            .into_iter()
            .enumerate()
            .map(|(rank, (_, inbox))| CommLayer {
                rank: rank as u32,
                peers: peers.clone(),
                inbox,
            })
            .collect()
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.peers.len()
    }

    /// A send handle to another rank, for handing to worker threads.
    pub fn sender_to(&self, rank: u32) -> Sender<TileMessage> {
        self.peers[rank as usize].clone()
    }

    /// Send a partial tile to `to`. Returns `false` if the peer endpoint is
    /// gone.
    pub fn send_tile(&self, to: u32, tile: Box<Tile>) -> bool {
        self.peers[to as usize]
            .send(TileMessage::WriteTile(tile))
            .is_ok()
    }

    /// Broadcast a frame cancel to every rank (including this one).
    pub fn broadcast_cancel(&self, reason: CancelReason) {
        for peer in &self.peers {
            let _ = peer.send(TileMessage::CancelFrame(reason));
        }
    }
}

/// Gather thread on the compositing rank: inbox -> reducer -> compositor.
pub struct TileGatherer;

impl TileGatherer {
    /// Spawn the gather loop for one frame. The loop ends when the frame
    /// finishes, is cancelled, all peers hang up, or `timeout` expires with
    /// the frame incomplete (which cancels it with a timeout reason).
    pub fn spawn(
        comm: CommLayer,
        reducer: Arc<TileReducer>,
        compositor: Arc<TileCompositor>,
        timeout: Duration,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            let future = compositor.future().clone();

            loop {
                if future.is_ready(SyncEvent::TaskFinished) || future.is_cancelled() {
                    break;
                }
                match comm.inbox.recv_deadline(deadline) {
                    Ok(TileMessage::WriteTile(tile)) => {
                        debug!(
                            "rank {} gathered partial for cell {} from rank {}",
                            comm.rank, tile.desc.cell, tile.owner_rank
                        );
                        if let Some(reduced) = reducer.submit_partial(tile) {
                            compositor.submit_tile(reduced);
                        }
                    }
                    Ok(TileMessage::CancelFrame(reason)) => {
                        future.cancel_with(reason);
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if !future.is_ready(SyncEvent::TaskFinished) {
                            warn!(
                                "rank {}: frame incomplete at gather deadline, cancelling",
                                comm.rank
                            );
                            future.cancel_with(CancelReason::Timeout);
                        }
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    }
}
