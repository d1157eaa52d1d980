//! Reliable byte-stream transport over UDP.
//!
//! A transport instance owns one bound UDP socket and speaks to a single
//! peer. Reliability follows the TCP playbook: cumulative acknowledgements,
//! a peer-advertised receive window, RFC 2988 retransmission timeouts, slow
//! start and congestion avoidance per RFC 2581 with fast retransmit and fast
//! recovery on triple duplicate acks. Datagrams are authenticated with a
//! keyed digest derived from two connection secrets concatenated in
//! role-asymmetric order.
//!
//! Each side opens its stream with the fixed hello `VUDPTransport-0.8`. The
//! connection is validated once the peer's hello was received intact and the
//! peer acknowledged ours; only then does stream data flow to the attached
//! byte producer, with the hello stripped.

pub mod codec;

use self::codec::{flags, Datagram, MAX_DATA, MAX_DGRAM, MAX_SEGMENT};
use crate::io::{
    advance_lim, headroom, notify_best_effort, Buffer, ByteConsumer, ByteConsumerRef, ByteIoPair,
    ByteProducer, ByteProducerRef, ControlMsg, Credit, EndpointId, Role,
};
use crate::reactor::{IoHandler, Scheduler};
use hashbrown::HashMap;
use quark::logging;
use quark::time::{duration_to_secs, secs_to_duration};
use quark::{CloseReason, IoError, IoResult};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

/// Protocol handshake message, the first bytes of every output stream.
pub const PROTO_HELLO: &[u8] = b"VUDPTransport-0.8";

/// Advertised receive window while the handshake is in flight.
const HSHAKE_WIN: u64 = 128;

/// Consecutive duplicate acks triggering fast retransmit.
const DUP_ACK_RESEND: u32 = 3;

/// Consecutive RTO back-offs invalidating the round-trip estimate.
const RTO_INVALIDATE_BACKOFF: u32 = 5;

/// Initial slow-start threshold, in segments.
const SSTHRESH_INIT: f64 = (65535 / MAX_DATA) as f64;

/// Datagrams read per reactor dispatch before yielding.
const READS_PER_DISPATCH: usize = MAX_DGRAM / MAX_DATA;

/// Transport tuning parameters.
#[derive(Clone, Serialize, Deserialize)]
pub struct RudpConfig {
    /// Length of the send and receive stream buffers.
    pub buf_len: usize,
    /// Advertised window step; defaults to a fifth of the buffer length.
    pub recv_win_step: Option<u64>,
    /// Initial retransmission timeout in seconds.
    pub rto_initial: f64,
    /// Lower RTO clamp in seconds.
    pub rto_min: f64,
    /// Upper RTO clamp in seconds.
    pub rto_max: f64,
    /// Maximum outstanding reactor timers.
    pub max_timers: usize,
    /// A new timer is armed only below this fraction of the nearest one.
    pub timer_reduce_factor: f64,
    /// Simulated uniform datagram loss in percent. Test affordance.
    pub loss_rate: u8,
}

impl Default for RudpConfig {
    fn default() -> RudpConfig {
        RudpConfig {
            buf_len: 65536,
            recv_win_step: None,
            rto_initial: 3.0,
            rto_min: 0.1,
            rto_max: 60.0,
            max_timers: 20,
            timer_reduce_factor: 0.8,
            loss_rate: 0,
        }
    }
}

/// Filter for UDP addresses of relayed connections.
///
/// The default implementation allows everything; deployments exposed to
/// untrusted relays should restrict both methods.
pub trait HostFilter {
    /// Whether a UDP handshake with the given relay address is allowed.
    fn allow_relay(&self, _addr: &SocketAddr) -> bool {
        true
    }

    /// Whether a transport handshake with the given peer address is allowed.
    fn allow_peer(&self, _addr: &SocketAddr) -> bool {
        true
    }
}

/// The default allow-everything filter.
pub struct AllowAllHosts;

impl HostFilter for AllowAllHosts {}

struct InFlight {
    data: Vec<u8>,
    /// Time of the most recent transmission of this segment.
    stamp: Instant,
    /// Per-segment timeout in seconds, backed off on retransmission.
    timeout: f64,
    retries: u32,
}

/// Externally visible side effects collected while the state machine runs
/// under its borrow; executed once the borrow is released.
enum Effect {
    CanProduce(ByteProducerRef, Credit),
    EndConsume(ByteConsumerRef, bool),
    AbortProducer(ByteProducerRef),
    AbortConsumer(ByteConsumerRef),
    Connected(ByteConsumerRef, SocketAddr),
    Produce,
    ScheduleSend,
    ArmTimer(Instant),
    DropSocket(mio::net::UdpSocket),
}

struct RudpState {
    peer: SocketAddr,
    send_secret: Vec<u8>,
    recv_secret: Vec<u8>,

    peer_validated: bool,
    peer_acked_hello: bool,
    validated: bool,
    failed: bool,

    sock: Option<mio::net::UdpSocket>,
    sock_closed: bool,

    in_closed: bool,
    out_closed: bool,
    out_sent_close: bool,
    in_close_reason: Option<CloseReason>,
    out_close_reason: Option<CloseReason>,

    sbuf: Buffer,
    sbuf_len: usize,
    /// Stream position of the send buffer start.
    sbuf_pos: u64,
    /// End of the peer's advertised window.
    send_lim: u64,
    /// Last acknowledged send position.
    send_acked: u64,
    in_fl: HashMap<u64, InFlight>,
    /// Sorted position index over `in_fl`.
    in_fl_pos: VecDeque<u64>,
    in_fl_bytes: usize,
    last_send_t: Option<Instant>,
    num_dup_ack: u32,

    rbuf: Buffer,
    rbuf_len: usize,
    /// Stream position of the receive buffer start.
    rbuf_spos: u64,
    /// Out-of-order segments keyed by stream position.
    recv_queue: BTreeMap<u64, Vec<u8>>,
    /// End of our advertised window.
    recv_win_end: u64,
    recv_win_step: u64,
    /// Last ack position sent to the peer.
    recv_acked: u64,
    recv_closing: bool,
    recv_close_pos: Option<u64>,

    force_ack: bool,
    force_resend: bool,
    fast_recovery: bool,

    srtt: Option<f64>,
    rttvar: f64,
    rto: f64,
    rto_num_backoff: u32,
    /// Congestion window in segments.
    cwnd: f64,
    ssthresh: f64,

    /// Outstanding timer deadlines, bounded by `max_timers`.
    timers: Vec<Instant>,

    ci_producer: Option<ByteProducerRef>,
    ci_eod: bool,
    ci_eod_clean: bool,
    ci_consumed: u64,
    ci_lim_sent: Credit,
    ci_aborted: bool,

    pi_consumer: Option<ByteConsumerRef>,
    pi_produced: u64,
    pi_prod_lim: Credit,
    pi_aborted: bool,

    log: logging::Logger,
}

#[inline]
fn elapsed_secs(now: Instant, since: Instant) -> f64 {
    duration_to_secs(now.checked_duration_since(since).unwrap_or_default())
}

impl RudpState {
    fn transmit(&mut self, cfg: &RudpConfig, pkg: &[u8]) -> io::Result<()> {
        if cfg.loss_rate > 0 && rand::thread_rng().gen_range(0..100) < cfg.loss_rate {
            // Simulated loss still counts as a transmission attempt
            return Ok(());
        }
        match &self.sock {
            Some(sock) => sock.send_to(pkg, &self.peer).map(|_| ()),
            None => Ok(()),
        }
    }

    fn sendable(&self) -> bool {
        !self.sock_closed && self.sock.is_some()
    }

    /// Current cumulative ack number for outgoing datagrams.
    fn ack_num(&self) -> u64 {
        self.rbuf_spos + self.rbuf.len() as u64
    }

    /// Advertised window end, stepped to stabilize updates.
    fn adv_win_end(&self) -> u64 {
        if self.validated {
            let adv_end = self.rbuf_spos + self.rbuf_len as u64;
            adv_end - adv_end % self.recv_win_step
        } else {
            HSHAKE_WIN
        }
    }

    fn gen_flag(&self, end_pos: u64) -> u8 {
        let mut flag = 0x00;
        if self.ci_eod && end_pos == self.sbuf_pos + self.sbuf.len() as u64 {
            flag |= flags::CLOSE;
        }
        if self.in_closed {
            flag |= flags::ACK_CLOSE;
        }
        flag
    }

    /// Regular send iteration: builds and transmits datagrams while there is
    /// something the peer needs to see.
    fn send_packages(&mut self, cfg: &RudpConfig, now: Instant, effects: &mut Vec<Effect>) {
        loop {
            if !self.sendable() {
                break;
            }

            // Determine if data can be sent (zero means no data)
            let mut max_data: u64 = 0;
            let mut check_close = false;
            if self.cwnd >= (self.in_fl.len() + 1) as f64 {
                if !self.sbuf.is_empty() {
                    if self.sbuf_pos < self.send_lim {
                        max_data = self.send_lim - self.sbuf_pos;
                    } else if self.sbuf_pos == self.send_lim {
                        // Allow a single probe octet past the advertised
                        // window once per RTO
                        let idle = match self.last_send_t {
                            Some(last) => elapsed_secs(now, last) >= self.rto,
                            None => true,
                        };
                        if idle {
                            max_data = 1;
                        }
                    }
                } else if self.ci_eod && !self.out_sent_close {
                    check_close = true;
                }
            }

            let ack_num = self.ack_num();
            let adv_end = self.adv_win_end();

            if self.force_resend && self.in_fl.is_empty() {
                self.force_resend = false;
            }
            if !(max_data > 0
                || check_close
                || ack_num > self.recv_acked
                || adv_end > self.recv_win_end
                || self.force_ack
                || self.force_resend)
            {
                break;
            }

            // Compose the datagram
            let (seq, data, resend_pos) = if self.force_resend {
                let pos = *self.in_fl_pos.front().expect("In-flight index out of sync");
                let data = self.in_fl[&pos].data.clone();
                (pos, data, Some(pos))
            } else {
                let take = (max_data.min(MAX_DATA as u64)) as usize;
                (self.sbuf_pos, self.sbuf.peek(take).to_vec(), None)
            };

            if !data.is_empty() {
                if let Some(last) = self.last_send_t {
                    // Re-enter slow start if idle for more than one RTO
                    if elapsed_secs(now, last) > self.rto {
                        self.cwnd = 2.0;
                    }
                }
            }

            let flag = self.gen_flag(seq + data.len() as u64);
            let pkg = codec::encode(
                &Datagram {
                    flags: flag,
                    seq,
                    ack: ack_num,
                    win: adv_end.saturating_sub(ack_num),
                    data: &data,
                },
                &self.send_secret,
            );

            match self.transmit(cfg, &pkg) {
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        self.c_abort(cfg, now, effects);
                    }
                    break;
                }
                Ok(()) => {
                    // Metadata went out, no separate forced ack needed
                    self.force_ack = false;

                    if !data.is_empty() {
                        match resend_pos {
                            Some(pos) => {
                                let entry =
                                    self.in_fl.get_mut(&pos).expect("In-flight entry missing");
                                entry.stamp = now;
                                entry.retries += 1;
                                self.force_resend = false;
                            }
                            None => {
                                let len = data.len();
                                self.sbuf.move_head(len);
                                self.in_fl.insert(
                                    self.sbuf_pos,
                                    InFlight {
                                        data,
                                        stamp: now,
                                        timeout: self.rto,
                                        retries: 0,
                                    },
                                );
                                self.in_fl_pos.push_back(self.sbuf_pos);
                                self.in_fl_bytes += len;
                                self.sbuf_pos += len as u64;
                            }
                        }

                        self.last_send_t = Some(now);
                        let rto = self.rto;
                        self.set_rto_timer(rto, cfg, now, effects);
                    }

                    self.recv_acked = ack_num;
                    self.recv_win_end = adv_end;
                    if flag & flags::CLOSE != 0 {
                        self.out_sent_close = true;
                    }
                }
            }
        }
    }

    /// Retransmits the in-flight segment at `pos`, backing off its own timer.
    fn resend_package(&mut self, pos: u64, cfg: &RudpConfig, now: Instant, effects: &mut Vec<Effect>) {
        if !self.sendable() {
            return;
        }
        let data = match self.in_fl.get(&pos) {
            Some(entry) => entry.data.clone(),
            None => return,
        };

        let ack_num = self.ack_num();
        let adv_end = self.adv_win_end();

        let flag = self.gen_flag(pos + data.len() as u64);
        let pkg = codec::encode(
            &Datagram {
                flags: flag,
                seq: pos,
                ack: ack_num,
                win: adv_end.saturating_sub(ack_num),
                data: &data,
            },
            &self.send_secret,
        );

        match self.transmit(cfg, &pkg) {
            Err(err) => {
                if err.kind() != io::ErrorKind::WouldBlock {
                    self.c_abort(cfg, now, effects);
                }
            }
            Ok(()) => {
                let rto = self.rto;
                let timeout = {
                    let entry = self.in_fl.get_mut(&pos).expect("In-flight entry missing");
                    entry.stamp = now;
                    entry.timeout = (2.0 * entry.timeout).min(rto);
                    entry.retries += 1;
                    entry.timeout
                };
                self.set_rto_timer(timeout, cfg, now, effects);

                self.recv_acked = ack_num;
                self.recv_win_end = adv_end;
                if flag & flags::CLOSE != 0 {
                    self.out_sent_close = true;
                }
            }
        }
    }

    /// Sends an ack datagram with no new information, so the peer can detect
    /// it as a duplicate ack.
    fn send_force_ack(&mut self, cfg: &RudpConfig, now: Instant, effects: &mut Vec<Effect>) {
        if !self.sendable() {
            return;
        }

        let seq = self.sbuf_pos;
        let ack_num = self.ack_num();
        let win = self.recv_win_end.saturating_sub(ack_num);

        let flag = self.gen_flag(seq);
        let pkg = codec::encode(
            &Datagram {
                flags: flag,
                seq,
                ack: ack_num,
                win,
                data: b"",
            },
            &self.send_secret,
        );

        if let Err(err) = self.transmit(cfg, &pkg) {
            if err.kind() != io::ErrorKind::WouldBlock {
                self.c_abort(cfg, now, effects);
            }
        }
    }

    /// Arms a timer for `delay` seconds from now, subject to the bounded
    /// timer pool: only when the pool is empty or the new delay undercuts the
    /// nearest timer by the configured reduction factor.
    fn set_rto_timer(&mut self, delay: f64, cfg: &RudpConfig, now: Instant, effects: &mut Vec<Effect>) {
        let delay = delay.max(0.0);

        if self.timers.len() >= cfg.max_timers {
            return;
        }

        let do_set = match self.timers.iter().min() {
            None => true,
            Some(&nearest) => {
                let set_delay =
                    duration_to_secs(nearest.checked_duration_since(now).unwrap_or_default());
                // Strict comparison avoids scheduling duplicate zero-delay
                // timers
                delay < cfg.timer_reduce_factor * set_delay
            }
        };

        if do_set {
            let deadline = now + secs_to_duration(delay);
            self.timers.push(deadline);
            effects.push(Effect::ArmTimer(deadline));
        }
    }

    /// Timer expiry handler: drains the expired pool, retransmits timed-out
    /// segments with RTO back-off, or paces window probes and close re-acks.
    fn handle_rto_timer(&mut self, cfg: &RudpConfig, now: Instant, effects: &mut Vec<Effect>) {
        // Flush all expired timers
        self.timers.retain(|&deadline| deadline > now);

        if !self.in_fl.is_empty() {
            // Retransmit all expired in-flight segments
            let positions: Vec<u64> = self.in_fl_pos.iter().cloned().collect();
            for pos in positions {
                let resend_t = match self.in_fl.get(&pos) {
                    Some(entry) => entry.stamp + secs_to_duration(entry.timeout.min(self.rto)),
                    None => continue,
                };
                if resend_t <= now {
                    self.resend_package(pos, cfg, now, effects);
                    // Back off the RTO and reset the congestion window
                    self.rto = (2.0 * self.rto).min(cfg.rto_max);
                    self.rto_num_backoff += 1;
                    self.ssthresh = ((self.in_fl.len() / 2).max(2)) as f64;
                    self.cwnd = 1.0;
                }
            }

            // Re-arm from the earliest future per-segment deadline
            let next = self
                .in_fl
                .values()
                .map(|entry| entry.stamp + secs_to_duration(entry.timeout.min(self.rto)))
                .min();
            if let Some(next) = next {
                let delay = duration_to_secs(next.checked_duration_since(now).unwrap_or_default());
                self.set_rto_timer(delay, cfg, now, effects);
            }
        } else {
            let mut can_send = false;
            let mut should_force = false;

            // A saturated window with buffered data warrants a probe octet
            if !self.out_closed && !self.sbuf.is_empty() && self.sbuf_pos == self.send_lim {
                can_send = true;
            }

            // Waiting for the peer to acknowledge our close warrants a re-ack
            if self.out_sent_close && !self.out_closed {
                should_force = true;
                can_send = true;
            }

            if can_send {
                let due = match self.last_send_t {
                    Some(last) => elapsed_secs(now, last) >= self.rto,
                    None => true,
                };
                if due {
                    if should_force {
                        self.force_ack = true;
                    }
                    self.send_packages(cfg, now, effects);
                    // Fake update so the next probe waits a full RTO
                    self.last_send_t = Some(now);
                    self.rto = (2.0 * self.rto).min(cfg.rto_max);
                    self.rto_num_backoff += 1;
                    // Probes and close re-acks repeat once per RTO
                    let rto = self.rto;
                    self.set_rto_timer(rto, cfg, now, effects);
                } else if let Some(last) = self.last_send_t {
                    let delay = duration_to_secs(
                        (last + secs_to_duration(self.rto))
                            .checked_duration_since(now)
                            .unwrap_or_default(),
                    );
                    self.set_rto_timer(delay, cfg, now, effects);
                }
            }
        }

        // Too many consecutive back-offs invalidate the round-trip estimate
        if self.rto_num_backoff >= RTO_INVALIDATE_BACKOFF {
            self.srtt = None;
            self.rttvar = 0.0;
        }
    }

    /// Processes one authenticated, parsed datagram.
    fn process_datagram(
        &mut self,
        dgram: &Datagram,
        cfg: &RudpConfig,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        let (seq, ack, win, data) = (dgram.seq, dgram.ack, dgram.win, dgram.data);

        if dgram.flags & flags::FAIL != 0 {
            self.fail("peer sent failure message", false, cfg, now, effects);
            return;
        }

        // Process ack data
        if ack > 0 && !self.peer_acked_hello {
            self.peer_acked_hello = true;
            self.validate(effects);
        }
        if ack > self.send_acked {
            // The ack must align with the end of an in-flight segment
            let mut matched: Option<(u64, Instant, u32)> = None;
            for &pos in &self.in_fl_pos {
                let entry = &self.in_fl[&pos];
                if ack == pos + entry.data.len() as u64 {
                    matched = Some((pos, entry.stamp, entry.retries));
                    break;
                }
            }
            let (pos, stamp, retries) = match matched {
                Some(found) => found,
                None => {
                    self.fail("acknowledge of unknown position", true, cfg, now, effects);
                    return;
                }
            };

            while let Some(&front) = self.in_fl_pos.front() {
                if front > pos {
                    break;
                }
                self.in_fl_pos.pop_front();
                if let Some(entry) = self.in_fl.remove(&front) {
                    self.in_fl_bytes -= entry.data.len();
                }
            }

            self.send_acked = ack;
            self.num_dup_ack = 0;

            // Update the congestion window, ending fast recovery if any
            if self.fast_recovery {
                self.cwnd = self.ssthresh;
                self.fast_recovery = false;
            } else if self.cwnd <= self.ssthresh {
                // Slow start
                self.cwnd += 1.0;
            } else {
                // Congestion avoidance
                self.cwnd += 1.0 / self.cwnd;
            }

            // A segment acked on first transmission samples the RTT
            if retries == 0 {
                let rtt = elapsed_secs(now, stamp);
                match self.srtt {
                    None => {
                        self.srtt = Some(rtt);
                        self.rttvar = rtt / 2.0;
                    }
                    Some(srtt) => {
                        self.rttvar = 0.75 * self.rttvar + 0.25 * (srtt - rtt).abs();
                        let srtt = 0.875 * srtt + 0.125 * rtt;
                        self.srtt = Some(srtt);
                    }
                }
                let old_rto = self.rto;
                self.rto = self.srtt.expect("SRTT just set") + 4.0 * self.rttvar;
                self.rto_num_backoff = 0;
                self.rto = self.rto.max(cfg.rto_min).min(cfg.rto_max);

                // Lazy-set a tighter timer if the RTO shrank
                if self.rto < old_rto && !self.in_fl.is_empty() {
                    let first = self.in_fl_pos[0];
                    let stamp = self.in_fl[&first].stamp;
                    let delay = duration_to_secs(
                        (stamp + secs_to_duration(self.rto))
                            .checked_duration_since(now)
                            .unwrap_or_default(),
                    );
                    self.set_rto_timer(delay, cfg, now, effects);
                }
            }
        } else {
            // Duplicate ack detection: same window, no data, unchanged ack
            let same_win = ack + win <= self.send_lim;
            if same_win && data.is_empty() {
                if !self.in_fl.is_empty() && ack == self.send_acked {
                    self.num_dup_ack += 1;

                    if self.num_dup_ack == DUP_ACK_RESEND {
                        // Fast retransmit and fast recovery
                        self.ssthresh = ((self.in_fl.len() / 2).max(2)) as f64;
                        self.cwnd = self.ssthresh + 3.0;
                        self.force_resend = true;
                        self.fast_recovery = true;
                    } else if self.num_dup_ack > DUP_ACK_RESEND {
                        self.cwnd += 1.0;
                    }
                } else if !self.fast_recovery {
                    self.num_dup_ack = 0;
                }
            }
        }

        // Process received data
        let mut rbuf_data_added = false;
        if !data.is_empty() {
            if self.in_closed || self.recv_closing {
                let close_pos = self.recv_close_pos.unwrap_or(0);
                if seq + data.len() as u64 > close_pos {
                    self.fail("got data past stream close position", true, cfg, now, effects);
                    return;
                }
            }

            if seq == self.recv_win_end {
                // Allow the peer a single octet past the receive window
                if data.len() > 1 {
                    self.fail("advertised window exceeded", true, cfg, now, effects);
                    return;
                }
                self.force_ack = true;
            } else {
                if seq + data.len() as u64 > self.recv_win_end {
                    self.fail("advertised window exceeded", true, cfg, now, effects);
                    return;
                }

                let mut rbuf_next = self.rbuf_spos + self.rbuf.len() as u64;
                if seq == rbuf_next {
                    self.rbuf.append(data);
                    rbuf_next += data.len() as u64;
                    rbuf_data_added = true;

                    // Drain contiguous successors from the reorder queue
                    loop {
                        let front = match self.recv_queue.iter().next() {
                            Some((&pos, _)) => pos,
                            None => break,
                        };
                        if front > rbuf_next {
                            break;
                        } else if front == rbuf_next {
                            let queued = self
                                .recv_queue
                                .remove(&front)
                                .expect("Reorder queue out of sync");
                            rbuf_next += queued.len() as u64;
                            self.rbuf.append(&queued);
                        } else {
                            self.fail("overlapping segments", true, cfg, now, effects);
                            return;
                        }
                    }
                } else if seq > rbuf_next {
                    // Reject overlaps that are not exact duplicates
                    let spos = seq;
                    let epos = seq + data.len() as u64;
                    let mut duplicate = false;
                    let mut overlap = false;
                    for (&pos, queued) in self.recv_queue.iter() {
                        if pos >= epos {
                            break;
                        }
                        if pos == spos && queued == data {
                            duplicate = true;
                            break;
                        } else if pos + queued.len() as u64 > spos {
                            overlap = true;
                            break;
                        }
                    }
                    if overlap {
                        self.fail("overlapping segments", true, cfg, now, effects);
                        return;
                    }
                    if !duplicate {
                        self.recv_queue.insert(seq, data.to_vec());
                    }
                    // Out-of-order data, force an immediate ack
                    self.force_ack = true;
                } else {
                    // Stale data, force an immediate ack
                    self.force_ack = true;
                }
            }

            if self.force_ack {
                // Resolve immediately so the peer can identify the package
                // as a duplicate ack
                self.send_force_ack(cfg, now, effects);
                self.force_ack = false;
            }
        }

        // The first received stream data must be the protocol hello; it is
        // consumed here and never reaches the attached producer
        if !self.peer_validated && !data.is_empty() {
            let hello = self.rbuf.pop_all();
            if hello != PROTO_HELLO {
                self.fail("invalid peer protocol handshake", true, cfg, now, effects);
                return;
            }
            self.peer_validated = true;
            self.rbuf_spos += hello.len() as u64;
            logging::debug!(self.log, "got valid peer protocol hello");

            // Make sure the peer gets our hello acked without waiting for
            // the retransmission timer
            if !self.peer_acked_hello && self.in_fl.contains_key(&0) {
                self.force_resend = true;
            }

            self.validate(effects);
        }

        // Close flag: the peer's stream ends at seq + len(data)
        if dgram.flags & flags::CLOSE != 0 {
            let close_pos = seq + data.len() as u64;
            if self.recv_closing {
                if self.recv_close_pos != Some(close_pos) {
                    self.fail("inconsistent close flag use by peer", true, cfg, now, effects);
                    return;
                }
            } else {
                if self.rbuf_spos + self.rbuf.len() as u64 > close_pos {
                    self.fail("close flag conflicts with other data", true, cfg, now, effects);
                    return;
                }
                let conflict = self
                    .recv_queue
                    .iter()
                    .any(|(&pos, queued)| pos + queued.len() as u64 > close_pos);
                if conflict {
                    self.fail("close flag conflicts with other data", true, cfg, now, effects);
                    return;
                }

                self.recv_closing = true;
                self.recv_close_pos = Some(close_pos);

                if self.recv_queue.is_empty()
                    && self.rbuf_spos + self.rbuf.len() as u64 == close_pos
                {
                    self.close_input(CloseReason::Completed, cfg, now, effects);
                    self.force_ack = true;
                }
            }
        }

        // Ack-close flag: the peer confirmed the end of our stream
        if dgram.flags & flags::ACK_CLOSE != 0 && !self.out_closed {
            if !self.ci_eod || !self.sbuf.is_empty() {
                // Premature ack-close means the peer aborted
                self.c_abort(cfg, now, effects);
            } else if self.in_fl.is_empty() {
                self.close_output(CloseReason::Completed, cfg, now, effects);
            }
        }

        // Update the send limit from the peer's advertised window
        self.send_lim = self.send_lim.max(ack + win);

        if rbuf_data_added {
            effects.push(Effect::Produce);
        }

        // Acks or window updates may be due
        self.send_packages(cfg, now, effects);
    }

    /// Marks the connection validated once both hello conditions hold.
    fn validate(&mut self, effects: &mut Vec<Effect>) {
        if self.validated || !self.peer_validated || !self.peer_acked_hello {
            return;
        }
        self.validated = true;
        logging::debug!(self.log, "connection validated");

        // Reset congestion parameters so handshake timeouts do not linger
        self.cwnd = self.cwnd.max(2.0);
        self.ssthresh = self.ssthresh.max(SSTHRESH_INIT);

        if let Some(consumer) = &self.pi_consumer {
            effects.push(Effect::Connected(consumer.clone(), self.peer));
        }

        // Advertise the real window size
        effects.push(Effect::ScheduleSend);

        if let Some(producer) = &self.ci_producer {
            self.ci_lim_sent = (self.sbuf_len - self.sbuf.len()) as Credit;
            effects.push(Effect::CanProduce(producer.clone(), self.ci_lim_sent));
        }
    }

    /// Re-evaluates the upstream consume limit after buffer changes.
    fn eval_consume_limit(&mut self, effects: &mut Vec<Effect>) {
        if !self.validated {
            return;
        }
        if let Some(producer) = &self.ci_producer {
            let free = self
                .sbuf_len
                .saturating_sub(self.sbuf.len())
                .saturating_sub(self.in_fl_bytes);
            let cur_lim = self.ci_consumed as Credit + free as Credit;
            if cur_lim > self.ci_lim_sent {
                self.ci_lim_sent = cur_lim;
                effects.push(Effect::CanProduce(producer.clone(), cur_lim));
            }
        }
    }

    fn close_input(
        &mut self,
        reason: CloseReason,
        cfg: &RudpConfig,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.in_closed {
            return;
        }
        if self.out_closed {
            self.close_io(reason, cfg, now, effects);
            return;
        }

        self.in_closed = true;
        self.in_close_reason = Some(reason);
        self.input_was_closed(reason, effects);
    }

    fn close_output(
        &mut self,
        reason: CloseReason,
        cfg: &RudpConfig,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.out_closed {
            return;
        }
        if self.in_closed {
            self.close_io(reason, cfg, now, effects);
            return;
        }

        self.out_closed = true;
        self.out_close_reason = Some(reason);
        self.output_was_closed(cfg, now, effects);
    }

    /// Closes both directions, sends a final ack carrying the status flags,
    /// and closes the socket exactly once.
    fn close_io(
        &mut self,
        reason: CloseReason,
        cfg: &RudpConfig,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.in_closed && self.out_closed {
            return;
        }
        let in_was_closed = self.in_closed;
        let out_was_closed = self.out_closed;
        self.in_closed = true;
        self.out_closed = true;

        // One final ack propagates the close flags
        if !self.failed {
            self.force_ack = true;
            self.send_packages(cfg, now, effects);
        }

        if let Some(sock) = self.sock.take() {
            effects.push(Effect::DropSocket(sock));
        }
        self.sock_closed = true;

        if !in_was_closed {
            self.in_close_reason = Some(reason);
            self.input_was_closed(reason, effects);
        }
        if !out_was_closed {
            self.out_close_reason = Some(reason);
            self.output_was_closed(cfg, now, effects);
        }
    }

    fn input_was_closed(&mut self, reason: CloseReason, effects: &mut Vec<Effect>) {
        match &self.pi_consumer {
            Some(consumer) => {
                effects.push(Effect::EndConsume(consumer.clone(), reason.is_clean()));
            }
            None => self.p_abort_inner(effects),
        }
    }

    fn output_was_closed(&mut self, cfg: &RudpConfig, now: Instant, effects: &mut Vec<Effect>) {
        self.c_abort(cfg, now, effects);
    }

    /// Aborts the consumer (outgoing) side.
    fn c_abort(&mut self, cfg: &RudpConfig, now: Instant, effects: &mut Vec<Effect>) {
        if self.ci_aborted {
            return;
        }
        self.ci_aborted = true;
        self.ci_eod = true;
        self.ci_consumed = 0;
        self.ci_lim_sent = 0;
        self.sbuf.clear();
        if !self.out_closed {
            self.close_output(CloseReason::Completed, cfg, now, effects);
        }
        if let Some(producer) = self.ci_producer.take() {
            effects.push(Effect::AbortProducer(producer));
        }
    }

    /// Aborts the producer (incoming) side.
    fn p_abort_inner(&mut self, effects: &mut Vec<Effect>) {
        if self.pi_aborted {
            return;
        }
        self.pi_aborted = true;
        self.pi_produced = 0;
        self.pi_prod_lim = 0;
        if let Some(consumer) = self.pi_consumer.take() {
            effects.push(Effect::AbortConsumer(consumer));
        }
    }

    fn p_abort(&mut self, cfg: &RudpConfig, now: Instant, effects: &mut Vec<Effect>) {
        if self.pi_aborted {
            return;
        }
        if !self.in_closed {
            self.close_input(CloseReason::Completed, cfg, now, effects);
        }
        self.p_abort_inner(effects);
    }

    /// Fails the connection: wire-level violations end up here.
    fn fail(
        &mut self,
        msg: &'static str,
        notify_peer: bool,
        cfg: &RudpConfig,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.failed {
            return;
        }
        logging::debug!(self.log, "connection failed"; "reason" => msg);

        // At most one terminal failure notification on the wire
        if notify_peer && self.sendable() {
            let pkg = codec::encode(
                &Datagram {
                    flags: flags::FAIL,
                    seq: self.sbuf_pos,
                    ack: self.ack_num(),
                    win: 0,
                    data: b"",
                },
                &self.send_secret,
            );
            drop(self.transmit(cfg, &pkg));
        }

        self.failed = true;
        self.close_io(CloseReason::Lost, cfg, now, effects);
        self.c_abort(cfg, now, effects);
        self.p_abort(cfg, now, effects);
    }
}

struct RudpCore {
    sched: Scheduler,
    config: RudpConfig,
    state: RefCell<RudpState>,
    token: Cell<Option<mio::Token>>,
    log: logging::Logger,
}

/// Reliable UDP transport to a single peer. See module documentation.
pub struct RudpTransport {
    core: Rc<RudpCore>,
}

impl RudpTransport {
    /// Creates a transport over a bound UDP socket, immediately transmitting
    /// the protocol hello to `peer`.
    ///
    /// `secret` is the local authentication secret, `peer_secret` the
    /// peer's; both sides derive their directional keys by concatenating the
    /// two in opposite order.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        sock: mio::net::UdpSocket,
        peer: SocketAddr,
        secret: &[u8],
        peer_secret: &[u8],
        config: RudpConfig,
        log: L,
    ) -> IoResult<RudpTransport> {
        let log = logging::child_or_discard(log);

        let mut send_secret = secret.to_vec();
        send_secret.extend_from_slice(peer_secret);
        let mut recv_secret = peer_secret.to_vec();
        recv_secret.extend_from_slice(secret);

        let recv_win_step = config
            .recv_win_step
            .unwrap_or((config.buf_len / 5) as u64)
            .max(1);

        let mut sbuf = Buffer::new(config.buf_len);
        sbuf.append(PROTO_HELLO);

        let state = RudpState {
            peer,
            send_secret,
            recv_secret,
            peer_validated: false,
            peer_acked_hello: false,
            validated: false,
            failed: false,
            sock: None,
            sock_closed: false,
            in_closed: false,
            out_closed: false,
            out_sent_close: false,
            in_close_reason: None,
            out_close_reason: None,
            sbuf,
            sbuf_len: config.buf_len,
            sbuf_pos: 0,
            send_lim: HSHAKE_WIN,
            send_acked: 0,
            in_fl: HashMap::new(),
            in_fl_pos: VecDeque::new(),
            in_fl_bytes: 0,
            last_send_t: None,
            num_dup_ack: 0,
            rbuf: Buffer::new(config.buf_len),
            rbuf_len: config.buf_len,
            rbuf_spos: 0,
            recv_queue: BTreeMap::new(),
            recv_win_end: 0,
            recv_win_step,
            recv_acked: 0,
            recv_closing: false,
            recv_close_pos: None,
            force_ack: false,
            force_resend: false,
            fast_recovery: false,
            srtt: None,
            rttvar: 0.0,
            rto: config.rto_initial,
            rto_num_backoff: 0,
            cwnd: 2.0,
            ssthresh: SSTHRESH_INIT,
            timers: Vec::new(),
            ci_producer: None,
            ci_eod: false,
            ci_eod_clean: true,
            ci_consumed: 0,
            ci_lim_sent: 0,
            ci_aborted: false,
            pi_consumer: None,
            pi_produced: 0,
            pi_prod_lim: 0,
            pi_aborted: false,
            log: log.clone(),
        };

        let core = Rc::new(RudpCore {
            sched: sched.clone(),
            config,
            state: RefCell::new(state),
            token: Cell::new(None),
            log,
        });

        let handler = Rc::new(RudpHandler { core: core.clone() });
        let token = sched.register(&sock, mio::Ready::readable(), handler)?;
        core.token.set(Some(token));
        core.state.borrow_mut().sock = Some(sock);

        // Transmit the protocol hello
        let now = Instant::now();
        let effects = {
            let mut effects = Vec::new();
            let mut state = core.state.borrow_mut();
            state.send_packages(&core.config, now, &mut effects);
            effects
        };
        RudpCore::run_effects(&core, effects);

        logging::debug!(core.log, "transport created"; "peer" => %peer);
        Ok(RudpTransport { core })
    }

    /// Like [`RudpTransport::new`], with the peer address checked against a
    /// host filter first.
    pub fn with_filter<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        sock: mio::net::UdpSocket,
        peer: SocketAddr,
        secret: &[u8],
        peer_secret: &[u8],
        config: RudpConfig,
        filter: &dyn HostFilter,
        log: L,
    ) -> IoResult<RudpTransport> {
        if !filter.allow_peer(&peer) {
            return Err(IoError::Contract("peer denied by UDP host filter"));
        }
        Self::new(sched, sock, peer, secret, peer_secret, config, log)
    }

    /// The byte consumer interface: bytes pushed here are transmitted to the
    /// peer.
    pub fn byte_consume(&self) -> ByteConsumerRef {
        Rc::new(RudpConsumerFacade {
            core: self.core.clone(),
        })
    }

    /// The byte producer interface: received stream bytes are pushed to the
    /// consumer attached here.
    pub fn byte_produce(&self) -> ByteProducerRef {
        Rc::new(RudpProducerFacade {
            core: self.core.clone(),
        })
    }

    pub fn byte_io(&self) -> ByteIoPair {
        ByteIoPair::new(self.byte_consume(), self.byte_produce())
    }

    /// True once both hello exchanges completed.
    pub fn validated(&self) -> bool {
        self.core.state.borrow().validated
    }

    /// True if the connection failed terminally.
    pub fn failed(&self) -> bool {
        self.core.state.borrow().failed
    }

    /// Aborts the transport, dropping all buffers and closing the socket.
    pub fn abort(&self) {
        let now = Instant::now();
        let effects = {
            let mut effects = Vec::new();
            let mut state = self.core.state.borrow_mut();
            state.c_abort(&self.core.config, now, &mut effects);
            state.p_abort(&self.core.config, now, &mut effects);
            state.close_io(CloseReason::Lost, &self.core.config, now, &mut effects);
            effects
        };
        RudpCore::run_effects(&self.core, effects);
    }
}

impl RudpCore {
    fn run_effects(core: &Rc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::CanProduce(producer, lim) => producer.can_produce(lim),
                Effect::EndConsume(consumer, clean) => consumer.end_consume(clean),
                Effect::AbortProducer(producer) => {
                    producer.abort();
                    producer.detach();
                }
                Effect::AbortConsumer(consumer) => {
                    consumer.abort();
                    consumer.detach();
                }
                Effect::Connected(consumer, peer) => {
                    core.sched.defer(move || {
                        notify_best_effort(|| consumer.control(&ControlMsg::Connected(&peer)));
                    });
                }
                Effect::Produce => Self::do_produce(core),
                Effect::ScheduleSend => {
                    let inner = core.clone();
                    core.sched.defer(move || {
                        let now = Instant::now();
                        let effects = {
                            let mut effects = Vec::new();
                            let mut state = inner.state.borrow_mut();
                            state.send_packages(&inner.config, now, &mut effects);
                            effects
                        };
                        Self::run_effects(&inner, effects);
                    });
                }
                Effect::ArmTimer(deadline) => {
                    let inner = core.clone();
                    core.sched.schedule_at(deadline, move || {
                        Self::on_timer(&inner);
                    });
                }
                Effect::DropSocket(sock) => {
                    if let Some(token) = core.token.take() {
                        drop(core.sched.deregister(&sock, token));
                    }
                    logging::debug!(core.log, "socket closed");
                    drop(sock);
                }
            }
        }
    }

    fn on_timer(core: &Rc<Self>) {
        let now = Instant::now();
        let effects = {
            let mut effects = Vec::new();
            let mut state = core.state.borrow_mut();
            state.handle_rto_timer(&core.config, now, &mut effects);
            effects
        };
        Self::run_effects(core, effects);
    }

    /// Reads and processes datagrams, bounded per dispatch so other
    /// descriptors are not starved. A saturated dispatch defers its own
    /// continuation, since the poll registration is edge triggered.
    fn do_read(core: &Rc<Self>) {
        let now = Instant::now();
        let mut buf = [0u8; 65536];
        let mut saturated = true;

        for _ in 0..READS_PER_DISPATCH {
            let effects = {
                let mut effects = Vec::new();
                let mut state = core.state.borrow_mut();

                if state.sock_closed {
                    saturated = false;
                    break;
                }

                let received = match &state.sock {
                    Some(sock) => sock.recv_from(&mut buf),
                    None => {
                        saturated = false;
                        break;
                    }
                };

                let (len, address) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        saturated = false;
                        if err.kind() != io::ErrorKind::WouldBlock {
                            state.p_abort(&core.config, now, &mut effects);
                            drop(state);
                            Self::run_effects(core, effects);
                        }
                        break;
                    }
                };

                if address != state.peer {
                    // Datagram from an unknown source, ignore
                    continue;
                }

                let dgram = &buf[..len];
                let payload = match codec::authenticate(dgram, &state.recv_secret) {
                    Some(payload) => payload,
                    None => {
                        // Unauthenticated datagram, silently dropped
                        logging::trace!(core.log, "dropped unauthenticated datagram");
                        continue;
                    }
                };

                if dgram.len() > MAX_SEGMENT {
                    saturated = false;
                    state.fail("maximum package size exceeded", true, &core.config, now, &mut effects);
                    drop(state);
                    Self::run_effects(core, effects);
                    break;
                }

                match codec::parse(payload) {
                    Ok(parsed) => {
                        state.process_datagram(&parsed, &core.config, now, &mut effects);
                    }
                    Err(_) => {
                        saturated = false;
                        state.fail("datagram format error", true, &core.config, now, &mut effects);
                        drop(state);
                        Self::run_effects(core, effects);
                        break;
                    }
                }
                effects
            };
            Self::run_effects(core, effects);
        }

        // Buffer levels may have changed; re-evaluate the upstream limit
        let effects = {
            let mut effects = Vec::new();
            let mut state = core.state.borrow_mut();
            state.eval_consume_limit(&mut effects);
            effects
        };
        Self::run_effects(core, effects);

        if saturated {
            // More datagrams may be pending beyond the dispatch bound
            let inner = core.clone();
            core.sched.defer(move || Self::do_read(&inner));
        }
    }

    /// Pushes received in-order stream data to the attached consumer.
    fn do_produce(core: &Rc<Self>) {
        let (consumer, mut rbuf) = {
            let mut state = core.state.borrow_mut();
            let consumer = match &state.pi_consumer {
                Some(consumer) => consumer.clone(),
                None => return,
            };
            if !state.validated {
                return;
            }
            if headroom(state.pi_produced, state.pi_prod_lim) == 0 {
                return;
            }
            if state.rbuf.is_empty() {
                return;
            }
            let rbuf = std::mem::replace(&mut state.rbuf, Buffer::new(0));
            (consumer, rbuf)
        };

        let old_len = rbuf.len();
        let result = consumer.consume(&mut rbuf);

        let effects = {
            let mut effects = Vec::new();
            let mut state = core.state.borrow_mut();
            let produced = old_len - rbuf.len();
            state.pi_produced += produced as u64;
            state.rbuf_spos += produced as u64;

            if state.pi_aborted {
                // The pipeline collapsed while we were delivering
                drop(rbuf);
            } else {
                // Undelivered bytes go back as the receive buffer
                state.rbuf = rbuf;
            }

            match result {
                Ok(new_lim) => {
                    state.pi_prod_lim = new_lim;
                }
                Err(IoError::Wait) | Err(IoError::MissingControl) => {}
                Err(_) => {
                    state.p_abort(&core.config, Instant::now(), &mut effects);
                }
            }

            // The freed window may be announced to the peer
            let now = Instant::now();
            state.send_packages(&core.config, now, &mut effects);

            // Schedule another round if more data can move
            if !state.rbuf.is_empty()
                && !state.pi_aborted
                && headroom(state.pi_produced, state.pi_prod_lim) != 0
            {
                effects.push(Effect::Produce);
            }
            effects
        };

        // Deferred rather than recursive to bound stack depth
        let produce_again = effects.iter().any(|e| matches!(e, Effect::Produce));
        let effects: Vec<Effect> = effects
            .into_iter()
            .filter(|e| !matches!(e, Effect::Produce))
            .collect();
        Self::run_effects(core, effects);
        if produce_again {
            let core = core.clone();
            core.sched.clone().defer(move || Self::do_produce(&core));
        }
    }

    // Byte consumer operations (outgoing direction)

    fn c_consume(core: &Rc<Self>, data: &mut Buffer) -> IoResult<Credit> {
        let now = Instant::now();
        let (result, effects) = {
            let mut effects = Vec::new();
            let mut state = core.state.borrow_mut();

            if state.out_closed {
                return Err(IoError::Closed);
            }
            if state.ci_eod {
                return Err(IoError::Closed);
            }
            if state.ci_producer.is_none() {
                return Err(IoError::Contract("no attached producer"));
            }
            if headroom(state.ci_consumed, state.ci_lim_sent) == 0 {
                return Err(IoError::Contract("consume limit exceeded"));
            }
            if data.is_empty() {
                return Err(IoError::Contract("no data to consume"));
            }

            let mut max_cons = state.sbuf_len.saturating_sub(state.sbuf.len());
            let room = headroom(state.ci_consumed, state.ci_lim_sent);
            if room >= 0 {
                max_cons = max_cons.min(room as usize);
            }

            let moved = data.transfer(&mut state.sbuf, max_cons);
            state.ci_consumed += moved as u64;

            state.send_packages(&core.config, now, &mut effects);

            let free = state
                .sbuf_len
                .saturating_sub(state.sbuf.len())
                .saturating_sub(state.in_fl_bytes);
            let lim = state.ci_consumed as Credit + free as Credit;
            state.ci_lim_sent = state.ci_lim_sent.max(lim);

            (Ok(state.ci_lim_sent), effects)
        };
        Self::run_effects(core, effects);
        result
    }

    fn c_end_consume(core: &Rc<Self>, clean: bool) {
        let now = Instant::now();
        let effects = {
            let mut effects = Vec::new();
            let mut state = core.state.borrow_mut();
            if state.out_closed || state.ci_eod {
                return;
            }
            state.ci_eod = true;
            state.ci_eod_clean = clean;
            state.send_packages(&core.config, now, &mut effects);
            effects
        };
        logging::debug!(core.log, "output stream ended"; "clean" => clean);
        Self::run_effects(core, effects);
    }

    fn c_abort(core: &Rc<Self>) {
        let now = Instant::now();
        let effects = {
            let mut effects = Vec::new();
            let mut state = core.state.borrow_mut();
            state.c_abort(&core.config, now, &mut effects);
            effects
        };
        Self::run_effects(core, effects);
    }

    fn c_attach(core: &Rc<Self>, producer: &ByteProducerRef) -> IoResult<()> {
        let lim = {
            let mut state = core.state.borrow_mut();
            if let Some(current) = &state.ci_producer {
                if current.endpoint_id() == producer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("producer already attached"));
            }
            state.ci_producer = Some(producer.clone());
            state.ci_consumed = 0;
            state.ci_lim_sent = 0;

            match state.validated {
                true => {
                    state.ci_lim_sent = (state.sbuf_len - state.sbuf.len()) as Credit;
                    Some(state.ci_lim_sent)
                }
                false => None,
            }
        };

        producer.attach(&(Rc::new(RudpConsumerFacade { core: core.clone() }) as ByteConsumerRef))?;
        if let Some(lim) = lim {
            producer.can_produce(lim);
        }
        notify_best_effort(|| producer.control(&ControlMsg::NotifyConsumerAttached));
        Ok(())
    }

    fn c_detach(core: &Rc<Self>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            match state.ci_producer.take() {
                Some(producer) => {
                    state.ci_consumed = 0;
                    state.ci_lim_sent = 0;
                    producer
                }
                None => return,
            }
        };
        producer.detach();
    }

    // Byte producer operations (incoming direction)

    fn p_can_produce(core: &Rc<Self>, limit: Credit) {
        let grew = {
            let mut state = core.state.borrow_mut();
            if state.pi_consumer.is_none() {
                return;
            }
            advance_lim(&mut state.pi_prod_lim, limit)
        };
        if grew {
            let core = core.clone();
            core.sched.clone().defer(move || Self::do_produce(&core));
        }
    }

    fn p_abort(core: &Rc<Self>) {
        let now = Instant::now();
        let effects = {
            let mut effects = Vec::new();
            let mut state = core.state.borrow_mut();
            state.p_abort(&core.config, now, &mut effects);
            effects
        };
        Self::run_effects(core, effects);
    }

    fn p_attach(core: &Rc<Self>, consumer: &ByteConsumerRef) -> IoResult<()> {
        let connected = {
            let mut state = core.state.borrow_mut();
            if let Some(current) = &state.pi_consumer {
                if current.endpoint_id() == consumer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("consumer already attached"));
            }
            state.pi_consumer = Some(consumer.clone());
            state.pi_produced = 0;
            state.pi_prod_lim = 0;
            match state.validated {
                true => Some(state.peer),
                false => None,
            }
        };

        consumer.attach(&(Rc::new(RudpProducerFacade { core: core.clone() }) as ByteProducerRef))?;
        notify_best_effort(|| consumer.control(&ControlMsg::NotifyProducerAttached));

        if let Some(peer) = connected {
            let consumer = consumer.clone();
            core.sched.defer(move || {
                notify_best_effort(|| consumer.control(&ControlMsg::Connected(&peer)));
            });
        }
        Ok(())
    }

    fn p_detach(core: &Rc<Self>) {
        let consumer = {
            let mut state = core.state.borrow_mut();
            match state.pi_consumer.take() {
                Some(consumer) => {
                    state.pi_produced = 0;
                    state.pi_prod_lim = 0;
                    consumer
                }
                None => return,
            }
        };
        consumer.detach();
    }
}

struct RudpHandler {
    core: Rc<RudpCore>,
}

impl IoHandler for RudpHandler {
    fn ready(&self, ready: mio::Ready) {
        if ready.is_readable() {
            RudpCore::do_read(&self.core);
        }
    }
}

struct RudpConsumerFacade {
    core: Rc<RudpCore>,
}

impl ByteConsumer for RudpConsumerFacade {
    fn consume(&self, data: &mut Buffer) -> IoResult<Credit> {
        RudpCore::c_consume(&self.core, data)
    }

    fn end_consume(&self, clean: bool) {
        RudpCore::c_end_consume(&self.core, clean)
    }

    fn abort(&self) {
        RudpCore::c_abort(&self.core)
    }

    fn attach(&self, producer: &ByteProducerRef) -> IoResult<()> {
        RudpCore::c_attach(&self.core, producer)
    }

    fn detach(&self) {
        RudpCore::c_detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Consumer)
    }
}

struct RudpProducerFacade {
    core: Rc<RudpCore>,
}

impl ByteProducer for RudpProducerFacade {
    fn can_produce(&self, limit: Credit) {
        RudpCore::p_can_produce(&self.core, limit)
    }

    fn abort(&self) {
        RudpCore::p_abort(&self.core)
    }

    fn attach(&self, consumer: &ByteConsumerRef) -> IoResult<()> {
        RudpCore::p_attach(&self.core, consumer)
    }

    fn detach(&self) {
        RudpCore::p_detach(&self.core)
    }

    fn control(&self, msg: &ControlMsg) -> IoResult<()> {
        match msg {
            ControlMsg::ReqProducerState => {
                let state = self.core.state.borrow();
                if state.validated {
                    if let Some(consumer) = state.pi_consumer.clone() {
                        let peer = state.peer;
                        drop(state);
                        self.core.sched.defer(move || {
                            notify_best_effort(|| {
                                consumer.control(&ControlMsg::Connected(&peer))
                            });
                        });
                    }
                }
                Ok(())
            }
            _ => Err(IoError::MissingControl),
        }
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::pipe::ByteSink;
    use crate::reactor::Reactor;
    use std::time::Duration;

    const LOCAL_SECRET: &[u8] = b"a";
    const PEER_SECRET: &[u8] = b"b";

    /// The scripted far side of a connection: a plain blocking UDP socket
    /// plus the peer's directional secrets.
    struct TestPeer {
        sock: std::net::UdpSocket,
        send_secret: Vec<u8>,
        recv_secret: Vec<u8>,
    }

    #[derive(Debug)]
    struct OwnedDgram {
        flags: u8,
        seq: u64,
        ack: u64,
        win: u64,
        data: Vec<u8>,
    }

    impl TestPeer {
        fn new() -> TestPeer {
            let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            sock.set_read_timeout(Some(Duration::from_millis(200))).unwrap();

            let mut send_secret = PEER_SECRET.to_vec();
            send_secret.extend_from_slice(LOCAL_SECRET);
            let mut recv_secret = LOCAL_SECRET.to_vec();
            recv_secret.extend_from_slice(PEER_SECRET);

            TestPeer {
                sock,
                send_secret,
                recv_secret,
            }
        }

        fn addr(&self) -> SocketAddr {
            self.sock.local_addr().unwrap()
        }

        fn recv(&self) -> Option<OwnedDgram> {
            let mut buf = [0u8; 65536];
            let (len, _) = match self.sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(_) => return None,
            };
            let payload = codec::authenticate(&buf[..len], &self.recv_secret)?;
            let parsed = codec::parse(payload).ok()?;
            Some(OwnedDgram {
                flags: parsed.flags,
                seq: parsed.seq,
                ack: parsed.ack,
                win: parsed.win,
                data: parsed.data.to_vec(),
            })
        }

        fn drain(&self) -> Vec<OwnedDgram> {
            let mut out = Vec::new();
            while let Some(dgram) = self.recv() {
                out.push(dgram);
            }
            out
        }

        fn send(&self, to: SocketAddr, flags: u8, seq: u64, ack: u64, win: u64, data: &[u8]) {
            let pkg = codec::encode(
                &Datagram {
                    flags,
                    seq,
                    ack,
                    win,
                    data,
                },
                &self.send_secret,
            );
            self.sock.send_to(&pkg, to).unwrap();
        }

        /// Sends raw bytes that will fail authentication.
        fn send_raw(&self, to: SocketAddr, bytes: &[u8]) {
            self.sock.send_to(bytes, to).unwrap();
        }
    }

    struct Harness {
        _reactor: Reactor,
        transport: RudpTransport,
        peer: TestPeer,
        local: SocketAddr,
    }

    fn harness() -> Harness {
        let reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let peer = TestPeer::new();
        let sock = mio::net::UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let local = sock.local_addr().unwrap();

        let transport = RudpTransport::new(
            &sched,
            sock,
            peer.addr(),
            LOCAL_SECRET,
            PEER_SECRET,
            RudpConfig::default(),
            None,
        )
        .unwrap();

        Harness {
            _reactor: reactor,
            transport,
            peer,
            local,
        }
    }

    fn read_now(h: &Harness) {
        RudpCore::do_read(&h.transport.core);
    }

    /// Brings a harness transport into the validated state: the peer acks
    /// our hello and delivers its own.
    fn validated_harness() -> Harness {
        let h = harness();

        // Our hello goes out at construction
        let hello = h.peer.recv().expect("No hello datagram");
        assert_eq!(hello.seq, 0);
        assert_eq!(hello.data, PROTO_HELLO);

        // Peer acks it and sends its own hello
        h.peer
            .send(h.local, 0, 0, PROTO_HELLO.len() as u64, 65536, PROTO_HELLO);
        read_now(&h);
        assert!(h.transport.validated());

        // Drop the ack traffic triggered by validation
        h.peer.drain();
        h
    }

    #[test]
    fn test_hello_sent_on_construction() {
        let h = harness();

        let dgram = h.peer.recv().expect("No hello datagram");
        assert_eq!(dgram.seq, 0);
        assert_eq!(dgram.ack, 0);
        assert_eq!(dgram.data, PROTO_HELLO);
        // Handshake window is fixed and small
        assert_eq!(dgram.win, HSHAKE_WIN);
        assert_eq!(dgram.flags, 0);
    }

    #[test]
    fn test_handshake_validates_connection() {
        let h = validated_harness();

        let state = h.transport.core.state.borrow();
        assert!(state.peer_validated);
        assert!(state.peer_acked_hello);
        assert_eq!(state.send_acked, PROTO_HELLO.len() as u64);
        assert!(state.in_fl.is_empty());
        // Hello was stripped and never becomes stream data
        assert!(state.rbuf.is_empty());
        assert_eq!(state.rbuf_spos, PROTO_HELLO.len() as u64);
        // Validation restores the congestion floor
        assert!(state.cwnd >= 2.0);
        assert!(state.ssthresh >= SSTHRESH_INIT);
    }

    #[test]
    fn test_tampered_datagram_is_ignored() {
        let h = harness();
        h.peer.recv();

        // A datagram with a bad tag must be silently dropped
        h.peer.send_raw(h.local, &[0u8; 64]);
        read_now(&h);
        assert!(!h.transport.failed());
        assert!(!h.transport.core.state.borrow().peer_validated);

        // An intact one still validates afterwards
        h.peer
            .send(h.local, 0, 0, PROTO_HELLO.len() as u64, 65536, PROTO_HELLO);
        read_now(&h);
        assert!(h.transport.validated());
    }

    #[test]
    fn test_bad_hello_fails_connection() {
        let h = harness();
        h.peer.recv();

        h.peer.send(h.local, 0, 0, 17, 65536, b"HELLO-IMPOSTOR!!!");
        read_now(&h);

        assert!(h.transport.failed());
        // The peer is notified with a single FAIL datagram
        let failure = h
            .peer
            .drain()
            .into_iter()
            .find(|d| d.flags & flags::FAIL != 0);
        assert!(failure.is_some());
    }

    #[test]
    fn test_received_data_reaches_attached_producer() {
        let h = validated_harness();
        let sched = h._reactor.scheduler();

        let sink = ByteSink::new(&sched, 4096, None).unwrap();
        sink.byte_consume().attach(&h.transport.byte_produce()).unwrap();

        let spos = PROTO_HELLO.len() as u64;
        h.peer.send(h.local, 0, spos, spos, 65536, b"hello world");
        read_now(&h);

        assert_eq!(sink.pop(4096), b"hello world".to_vec());

        // The transport acked the new data with a stepped window
        let acks = h.peer.drain();
        let last = acks.last().expect("No ack for data");
        assert_eq!(last.ack, spos + 11);
        assert_eq!((last.ack + last.win) % h.transport.core.state.borrow().recv_win_step, 0);
    }

    #[test]
    fn test_out_of_order_data_is_reordered() {
        let h = validated_harness();
        let sched = h._reactor.scheduler();

        let sink = ByteSink::new(&sched, 4096, None).unwrap();
        sink.byte_consume().attach(&h.transport.byte_produce()).unwrap();

        let spos = PROTO_HELLO.len() as u64;

        // Second segment first; it must be queued and acked immediately
        h.peer.send(h.local, 0, spos + 5, spos, 65536, b"world");
        read_now(&h);
        assert_eq!(sink.len(), 0);
        let dup = h.peer.drain();
        assert!(dup.iter().any(|d| d.ack == spos && d.data.is_empty()));

        // The gap fill delivers both segments in order
        h.peer.send(h.local, 0, spos, spos, 65536, b"hell ");
        read_now(&h);
        assert_eq!(sink.pop(4096), b"hell world".to_vec());
    }

    #[test]
    fn test_overlapping_segments_fail() {
        let h = validated_harness();
        let spos = PROTO_HELLO.len() as u64;

        h.peer.send(h.local, 0, spos + 10, spos, 65536, b"abcdef");
        read_now(&h);
        assert!(!h.transport.failed());

        // Overlaps an already queued segment without matching it
        h.peer.send(h.local, 0, spos + 12, spos, 65536, b"zz");
        read_now(&h);
        assert!(h.transport.failed());
    }

    #[test]
    fn test_exact_duplicate_segment_is_tolerated() {
        let h = validated_harness();
        let spos = PROTO_HELLO.len() as u64;

        h.peer.send(h.local, 0, spos + 10, spos, 65536, b"abcdef");
        read_now(&h);
        h.peer.send(h.local, 0, spos + 10, spos, 65536, b"abcdef");
        read_now(&h);

        assert!(!h.transport.failed());
    }

    #[test]
    fn test_window_violation_fails() {
        let h = validated_harness();
        let state_win_end = h.transport.core.state.borrow().recv_win_end;

        // Two octets at the window edge exceed the probe allowance
        h.peer.send(h.local, 0, state_win_end, 17, 65536, b"xy");
        read_now(&h);
        assert!(h.transport.failed());
    }

    #[test]
    fn test_probe_octet_at_window_edge_is_absorbed() {
        let h = validated_harness();
        let state_win_end = h.transport.core.state.borrow().recv_win_end;

        h.peer.send(h.local, 0, state_win_end, 17, 65536, b"x");
        read_now(&h);

        assert!(!h.transport.failed());
        // The probe forces an immediate ack
        assert!(!h.peer.drain().is_empty());
    }

    #[test]
    fn test_duplicate_acks_trigger_fast_retransmit() {
        let h = validated_harness();
        let cfg = h.transport.core.config.clone();
        let now = Instant::now();

        // Queue five segments worth of data and open the congestion window
        {
            let mut state = h.transport.core.state.borrow_mut();
            state.cwnd = 10.0;
            let payload = vec![0x5au8; 5 * MAX_DATA];
            state.sbuf.append(&payload);
            let mut effects = Vec::new();
            state.send_packages(&cfg, now, &mut effects);
        }

        let sent = h.peer.drain();
        let data_segments: Vec<_> = sent.iter().filter(|d| !d.data.is_empty()).collect();
        assert_eq!(data_segments.len(), 5);
        let first_seq = data_segments[0].seq;
        assert_eq!(first_seq, PROTO_HELLO.len() as u64);

        // Three duplicate acks for the pre-data position
        let spos = PROTO_HELLO.len() as u64;
        for _ in 0..3 {
            h.peer.send(h.local, 0, spos, spos, 65536, b"");
            read_now(&h);
        }

        {
            let state = h.transport.core.state.borrow();
            assert!(state.fast_recovery);
            assert_eq!(state.ssthresh, 2.0);
            assert_eq!(state.cwnd, state.ssthresh + 3.0);
            assert_eq!(state.num_dup_ack, 3);
        }

        // The first unacked segment was retransmitted before any timer
        let resent = h.peer.drain();
        assert!(resent.iter().any(|d| d.seq == first_seq && !d.data.is_empty()));

        // A new cumulative ack ends fast recovery at cwnd == ssthresh
        h.peer
            .send(h.local, 0, spos, first_seq + MAX_DATA as u64, 65536, b"");
        read_now(&h);

        let state = h.transport.core.state.borrow();
        assert!(!state.fast_recovery);
        assert_eq!(state.cwnd, state.ssthresh);
        assert_eq!(state.send_acked, first_seq + MAX_DATA as u64);
    }

    #[test]
    fn test_probe_octet_when_send_window_saturated() {
        let h = validated_harness();
        let cfg = h.transport.core.config.clone();
        let now = Instant::now();

        {
            let mut state = h.transport.core.state.borrow_mut();
            state.sbuf.append(b"pending data");
            state.send_lim = state.sbuf_pos;
            state.last_send_t = None;
            let mut effects = Vec::new();
            state.send_packages(&cfg, now, &mut effects);
        }

        let sent = h.peer.drain();
        let probes: Vec<_> = sent.iter().filter(|d| !d.data.is_empty()).collect();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].data.len(), 1);

        // In-flight never exceeds the window except for the probe octet
        let state = h.transport.core.state.borrow();
        assert_eq!(state.in_fl_bytes, 1);
        assert!(state.sbuf_pos <= state.send_lim + 1);
    }

    #[test]
    fn test_rto_timer_backoff_and_estimate_invalidation() {
        let h = validated_harness();
        let cfg = h.transport.core.config.clone();
        let now = Instant::now();

        {
            let mut state = h.transport.core.state.borrow_mut();
            state.srtt = Some(0.5);
            state.rttvar = 0.1;
            state.sbuf.append(b"retransmit me");
            let mut effects = Vec::new();
            state.send_packages(&cfg, now, &mut effects);
            assert_eq!(state.in_fl.len(), 1);
        }
        h.peer.drain();

        let rto_before = h.transport.core.state.borrow().rto;

        // Run the timer handler with the segment long expired, five times
        for round in 0..5u32 {
            let late = now + Duration::from_secs(120 * (round as u64 + 1));
            let mut state = h.transport.core.state.borrow_mut();
            let mut effects = Vec::new();
            state.handle_rto_timer(&cfg, late, &mut effects);
            assert_eq!(state.rto_num_backoff, round + 1);
            assert_eq!(state.cwnd, 1.0);
        }

        let state = h.transport.core.state.borrow();
        // RTO backed off but stays clamped
        assert!(state.rto > rto_before);
        assert!(state.rto <= cfg.rto_max);
        // Five consecutive back-offs invalidate the round-trip estimate
        assert_eq!(state.srtt, None);

        // The retransmissions actually went out
        let resent = h.peer.drain();
        assert!(resent.iter().filter(|d| !d.data.is_empty()).count() >= 5);
    }

    #[test]
    fn test_rtt_sample_updates_rto_within_bounds() {
        let h = validated_harness();
        let cfg = h.transport.core.config.clone();
        let now = Instant::now();

        {
            let mut state = h.transport.core.state.borrow_mut();
            state.sbuf.append(b"sample");
            let mut effects = Vec::new();
            state.send_packages(&cfg, now, &mut effects);
        }
        h.peer.drain();

        // Ack arrives quickly; the RTO must respect the lower clamp
        let spos = PROTO_HELLO.len() as u64;
        h.peer.send(h.local, 0, spos, spos + 6, 65536, b"");
        read_now(&h);

        let state = h.transport.core.state.borrow();
        assert!(state.srtt.is_some());
        assert!(state.rto >= cfg.rto_min);
        assert!(state.rto <= cfg.rto_max);
        assert_eq!(state.rto_num_backoff, 0);
    }

    #[test]
    fn test_close_handshake() {
        let h = validated_harness();

        // End our output stream; with an empty buffer the close flag goes
        // out on an empty segment
        RudpCore::c_end_consume(&h.transport.core, true);
        let sent = h.peer.drain();
        assert!(sent.iter().any(|d| d.flags & flags::CLOSE != 0));
        assert!(h.transport.core.state.borrow().out_sent_close);

        // Peer acknowledges our close
        let spos = PROTO_HELLO.len() as u64;
        h.peer.send(h.local, flags::ACK_CLOSE, spos, spos, 65536, b"");
        read_now(&h);
        assert!(h.transport.core.state.borrow().out_closed);
        assert!(!h.transport.core.state.borrow().in_closed);

        // Peer closes its own stream; both directions closed ends the
        // connection and the socket is closed exactly once
        h.peer.send(h.local, flags::CLOSE, spos, spos, 65536, b"");
        read_now(&h);

        let state = h.transport.core.state.borrow();
        assert!(state.in_closed);
        assert!(state.out_closed);
        assert!(state.sock_closed);
        assert!(state.sock.is_none());
        assert_eq!(state.in_close_reason, Some(CloseReason::Completed));
    }

    #[test]
    fn test_premature_ack_close_aborts() {
        let h = validated_harness();

        // ACK_CLOSE while our stream is still open means the peer aborted
        let spos = PROTO_HELLO.len() as u64;
        {
            let mut state = h.transport.core.state.borrow_mut();
            state.sbuf.append(b"unsent");
        }
        h.peer.send(h.local, flags::ACK_CLOSE, spos, spos, 65536, b"");
        read_now(&h);

        let state = h.transport.core.state.borrow();
        assert!(state.ci_aborted);
        assert!(state.out_closed);
    }

    #[test]
    fn test_close_position_conflict_fails() {
        let h = validated_harness();
        let spos = PROTO_HELLO.len() as u64;

        // Close at a position before already buffered data
        h.peer.send(h.local, 0, spos, spos, 65536, b"abcdef");
        read_now(&h);
        h.peer.send(h.local, flags::CLOSE, spos + 2, spos, 65536, b"");
        read_now(&h);

        assert!(h.transport.failed());
    }

    #[test]
    fn test_misaligned_ack_fails() {
        let h = validated_harness();
        let cfg = h.transport.core.config.clone();
        let now = Instant::now();

        {
            let mut state = h.transport.core.state.borrow_mut();
            state.sbuf.append(b"0123456789");
            let mut effects = Vec::new();
            state.send_packages(&cfg, now, &mut effects);
        }
        h.peer.drain();

        // Ack into the middle of the in-flight segment
        let spos = PROTO_HELLO.len() as u64;
        h.peer.send(h.local, 0, spos, spos + 4, 65536, b"");
        read_now(&h);

        assert!(h.transport.failed());
    }

    #[test]
    fn test_timer_pool_is_bounded() {
        let h = validated_harness();
        let cfg = h.transport.core.config.clone();
        let now = Instant::now();

        let mut state = h.transport.core.state.borrow_mut();
        let mut effects = Vec::new();
        for idx in 0..(cfg.max_timers * 2) {
            state.set_rto_timer(60.0 - idx as f64, &cfg, now, &mut effects);
        }
        assert!(state.timers.len() <= cfg.max_timers);

        // Only sufficiently tighter timers enter the pool
        let before = state.timers.len();
        state.set_rto_timer(59.0, &cfg, now, &mut effects);
        assert_eq!(state.timers.len(), before);
    }

    #[test]
    fn test_host_filter_denies_peer() {
        struct DenyAll;
        impl HostFilter for DenyAll {
            fn allow_peer(&self, _addr: &SocketAddr) -> bool {
                false
            }
        }

        let reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();
        let peer = TestPeer::new();
        let sock = mio::net::UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();

        let result = RudpTransport::with_filter(
            &sched,
            sock,
            peer.addr(),
            LOCAL_SECRET,
            PEER_SECRET,
            RudpConfig::default(),
            &DenyAll,
            None,
        );
        assert!(result.is_err());

        // Nothing was transmitted to the denied peer
        assert!(peer.recv().is_none());
    }

    #[test]
    fn test_foreign_source_address_is_ignored() {
        let h = harness();
        h.peer.recv();

        // A different socket with the right secrets is still not the peer
        let intruder = TestPeer::new();
        intruder.send(h.local, 0, 0, 17, 65536, PROTO_HELLO);
        read_now(&h);

        assert!(!h.transport.core.state.borrow().peer_validated);
        assert!(!h.transport.failed());
    }
}
