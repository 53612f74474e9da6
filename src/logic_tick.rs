//! The background thread that periodically advances every peer and reaps timeouts.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::demux::Demultiplexer;
use crate::event::Event;
use crate::peer::{ConnectionState, DisconnectReason};
use crate::shared::Shared;
use crate::time::LocalTime;

/// Runs the periodic maintenance loop until `shared.running` is cleared.
///
/// Each iteration: drains matured debug-delay entries back into the receive path, walks the peer
/// table advancing every peer, demotes idle `Connected` peers to `Disconnected` with a
/// `Disconnect(reason = Timeout)` event, collects already-`Disconnected` peers that have now sat
/// idle past the same timeout and reaps them in one batch, then sleeps out the remainder of
/// `update_time_ms`. A timed-out peer is left resident for this reap branch to pick up on a
/// later tick rather than being removed the instant it goes idle.
pub fn run(shared: Arc<Shared>) {
    debug!("logic tick starting");
    let mut previous_tick = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        let tick_started = Instant::now();
        let elapsed_ms = tick_started
            .saturating_duration_since(previous_tick)
            .as_millis()
            .max(1) as u64;
        previous_tick = tick_started;

        let now = LocalTime::now();
        for (bytes, endpoint) in shared.delay_queue.drain_matured(now) {
            Demultiplexer::handle_datagram(&shared, &bytes, endpoint);
        }

        let disconnect_timeout = shared.config.disconnect_timeout_ms;
        let mut to_remove = Vec::new();
        for peer in shared.table.snapshot() {
            let idle = peer.time_since_last_packet(now) > disconnect_timeout;
            match peer.connection_state() {
                ConnectionState::Disconnected if idle => to_remove.push(peer),
                ConnectionState::Connected if idle => {
                    if peer.mark_timed_out() {
                        shared.mark_disconnected();
                        shared.emit(Event::Disconnect {
                            peer: peer.clone(),
                            reason: DisconnectReason::Timeout,
                            additional_data: Vec::new(),
                            socket_error_code: None,
                        });
                    }
                }
                _ => peer.update(elapsed_ms),
            }
        }
        if !to_remove.is_empty() {
            trace!(count = to_remove.len(), "reaping timed-out peers");
            shared.table.remove_peers(&to_remove);
        }

        let period = Duration::from_millis(shared.config.update_time_ms);
        let spent = tick_started.elapsed();
        if let Some(remaining) = period.checked_sub(spent) {
            thread::sleep(remaining);
        }
    }
    debug!("logic tick stopped");
}
