//! The multiplexer itself: connection setup, pipe lifecycle, the reliable
//! data path, and the barrier/gather collectives built on top of the wire
//! formats, packet pool, and per-pipe state defined elsewhere in this crate.
//!
//! Exactly one packet-handling thread runs per node (master or slave).
//! Every other thread touches `PipeState` only through `LockedPipe`, and
//! only ever sends through `Shared::send_to`, which serializes on
//! `socket_mutex`. Pipe id 0 is reserved: both sides use its `PipeState` as
//! the synchronization channel for pipe creation, since pipe ids are
//! assigned by calling order and are therefore already identical on every
//! node without needing their own handshake.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::packet::PacketPool;
use crate::pipe::{deadline_after, LockedPipe, PipeState, PipeTable};
use crate::socket::{self, SocketConfig};
use crate::stream_pos::StreamPos;
use crate::wire::{
    self, GatherOp, MasterMessage, MasterMessageId, SlaveMessage, SlaveMessageId, DATA_HEADER_SIZE,
    MAX_PACKET_SIZE,
};

/// Tunable timeouts, burst sizes, and buffer limits, set once at
/// construction. Defaults match a conservative LAN deployment.
#[derive(Debug, Clone)]
pub struct Config {
    pub connection_wait_timeout: Duration,
    pub ping_timeout: Duration,
    pub max_ping_requests: u32,
    pub receive_wait_timeout: Duration,
    pub barrier_wait_timeout: Duration,
    pub send_buffer_size: usize,
    pub master_message_burst_size: u32,
    pub slave_message_burst_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connection_wait_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_secs(10),
            max_ping_requests: 3,
            receive_wait_timeout: Duration::from_millis(250),
            barrier_wait_timeout: Duration::from_millis(100),
            send_buffer_size: 50,
            master_message_burst_size: 1,
            slave_message_burst_size: 1,
        }
    }
}

impl Config {
    pub fn with_connection_wait_timeout(mut self, d: Duration) -> Self {
        self.connection_wait_timeout = d;
        self
    }

    pub fn with_ping_timeout(mut self, d: Duration) -> Self {
        self.ping_timeout = d;
        self
    }

    pub fn with_max_ping_requests(mut self, n: u32) -> Self {
        self.max_ping_requests = n;
        self
    }

    pub fn with_receive_wait_timeout(mut self, d: Duration) -> Self {
        self.receive_wait_timeout = d;
        self
    }

    pub fn with_barrier_wait_timeout(mut self, d: Duration) -> Self {
        self.barrier_wait_timeout = d;
        self
    }

    pub fn with_send_buffer_size(mut self, n: usize) -> Self {
        self.send_buffer_size = n;
        self
    }

    pub fn with_master_message_burst_size(mut self, n: u32) -> Self {
        self.master_message_burst_size = n;
        self
    }

    pub fn with_slave_message_burst_size(mut self, n: u32) -> Self {
        self.slave_message_burst_size = n;
        self
    }
}

/// Process-wide state shared between the public API (called from any user
/// thread) and the packet-handling thread.
struct Shared {
    node_index: u32,
    num_slaves: u32,
    socket: std::net::UdpSocket,
    socket_mutex: Mutex<()>,
    peer_addr: SocketAddrV4,
    pipe_table: PipeTable,
    packet_pool: PacketPool,
    next_pipe_id: AtomicU32,
    connected: Mutex<bool>,
    connected_cond: Condvar,
    running: AtomicBool,
    fatal_error: Mutex<Option<Error>>,
    config: Config,
}

impl Shared {
    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn mark_connected(&self) {
        let mut connected = self.connected.lock().unwrap();
        if !*connected {
            *connected = true;
            self.connected_cond.notify_all();
        }
    }

    /// Records a fatal error and stops the packet-handling thread. Blocked
    /// API callers pick this up the next time their own wait times out.
    fn fail(&self, err: Error) {
        warn!("packet-handling thread for node {} stopping: {}", self.node_index, err);
        *self.fatal_error.lock().unwrap() = Some(err);
        self.running.store(false, Ordering::SeqCst);
        self.pipe_table.notify_all();
        self.connected_cond.notify_all();
    }

    fn take_fatal_error(&self) -> Error {
        self.fatal_error
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Error::CommunicationLost { attempts: 0 })
    }

    fn send_to(&self, buf: &[u8]) {
        let _guard = self.socket_mutex.lock().unwrap();
        if let Err(e) = self.socket.send_to(buf, self.peer_addr) {
            warn!("send to {} failed: {}", self.peer_addr, e);
        }
    }

    fn send_master_burst(&self, msg: &MasterMessage) {
        let wire = msg.encode();
        for _ in 0..self.config.master_message_burst_size.max(1) {
            self.send_to(&wire);
        }
    }

    fn send_slave_burst(&self, msg: &SlaveMessage) {
        let wire = msg.encode();
        for _ in 0..self.config.slave_message_burst_size.max(1) {
            self.send_to(&wire);
        }
    }
}

/// A reliable, ordered, multi-stream pipe multiplexer over one UDP
/// multicast/broadcast socket. One node is the master (`node_index == 0`);
/// the rest are slaves.
pub struct Multiplexer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Multiplexer {
    pub fn new(node_index: u32, num_slaves: u32, socket_config: SocketConfig) -> Result<Self> {
        Self::with_config(node_index, num_slaves, socket_config, Config::default())
    }

    pub fn with_config(
        node_index: u32,
        num_slaves: u32,
        socket_config: SocketConfig,
        config: Config,
    ) -> Result<Self> {
        let (socket, peer_addr) = socket::setup(&socket_config)?;

        let pipe_table = PipeTable::new();
        if node_index == 0 {
            pipe_table.insert(0, PipeState::new_master(num_slaves));
        } else {
            pipe_table.insert(0, PipeState::new_slave(node_index));
        }

        let shared = Arc::new(Shared {
            node_index,
            num_slaves,
            socket,
            socket_mutex: Mutex::new(()),
            peer_addr,
            pipe_table,
            packet_pool: PacketPool::new(),
            next_pipe_id: AtomicU32::new(1),
            connected: Mutex::new(node_index == 0 && num_slaves == 0),
            connected_cond: Condvar::new(),
            running: AtomicBool::new(true),
            fatal_error: Mutex::new(None),
            config,
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("mpipe-node-{}", node_index))
            .spawn(move || {
                if thread_shared.node_index == 0 {
                    run_master(thread_shared);
                } else {
                    run_slave(thread_shared);
                }
            })
            .map_err(Error::SocketSetupFailed)?;

        Ok(Multiplexer {
            shared,
            thread: Some(thread),
        })
    }

    /// Blocks until every slave has connected to the master (a no-op if
    /// already connected). No built-in deadline; callers wanting one race
    /// this against an external timer. Returns the packet-handling
    /// thread's fatal error if it stops before connecting.
    pub fn wait_for_connection(&self) -> Result<()> {
        let mut connected = self.shared.connected.lock().unwrap();
        while !*connected {
            if !self.shared.running.load(Ordering::SeqCst) {
                return Err(self.shared.take_fatal_error());
            }
            connected = self.shared.connected_cond.wait(connected).unwrap();
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Creates a new pipe, returning its id. Must be called in the same
    /// order on every node; ids are assigned locally, not distributed by
    /// the master.
    pub fn open_pipe(&self) -> Result<u32> {
        let pipe_id = self.shared.next_pipe_id.fetch_add(1, Ordering::SeqCst);
        if self.shared.node_index == 0 {
            self.shared
                .pipe_table
                .insert(pipe_id, PipeState::new_master(self.shared.num_slaves));
            self.run_master_round(0, MasterMessageId::CreatePipe, pipe_id)?;
        } else {
            self.shared
                .pipe_table
                .insert(pipe_id, PipeState::new_slave(self.shared.node_index));
            self.run_slave_round(0, SlaveMessageId::CreatePipe, pipe_id)?;
        }
        Ok(pipe_id)
    }

    /// Flushes and synchronizes `pipe_id` via a barrier, then removes it
    /// from the table and returns any residual buffered packets to the
    /// pool.
    pub fn close_pipe(&self, pipe_id: u32) -> Result<()> {
        self.barrier(pipe_id)?;
        match self.shared.pipe_table.remove(pipe_id) {
            Some(state) => {
                let mut locked = state.lock();
                locked.packets.drain_to_pool(&self.shared.packet_pool);
                Ok(())
            }
            None => Err(Error::DoubleClose(pipe_id)),
        }
    }

    /// Master-only: enqueues `payload` for delivery on `pipe_id`, blocking
    /// if the retained send queue is already at `send_buffer_size` (flow
    /// control against the slowest slave).
    pub fn send_packet(&self, pipe_id: u32, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(self.shared.node_index, 0, "only the master sends data packets");
        assert!(payload.len() <= MAX_PACKET_SIZE, "payload exceeds MAX_PACKET_SIZE");

        let mut locked = self.find_pipe(pipe_id)?;
        while locked.packets.len() >= self.shared.config.send_buffer_size {
            if !self.shared.running.load(Ordering::SeqCst) {
                return Err(self.shared.take_fatal_error());
            }
            // Bounded, not `wait_receive`, so a dead packet-handling thread
            // (running flipped false without a final notify) can't wedge a
            // sender here forever.
            locked.wait_receive_until(deadline_after(self.shared.config.receive_wait_timeout));
        }

        let mut packet = self.shared.packet_pool.take();
        packet.pipe_id = pipe_id;
        packet.stream_pos = locked.stream_pos;
        packet.set_payload(payload);

        let mut wire = Vec::with_capacity(DATA_HEADER_SIZE + payload.len());
        wire.extend_from_slice(&wire::encode_data_header(pipe_id, locked.stream_pos.get()));
        wire.extend_from_slice(payload);

        locked.stream_pos += payload.len() as u32;
        locked.packets.push_back(packet);
        drop(locked);

        self.shared.send_to(&wire);
        Ok(())
    }

    /// Slave-only: blocks until a packet is available on `pipe_id`,
    /// sending a defensive PACKETLOSS burst if nothing arrives within
    /// `receive_wait_timeout`.
    pub fn receive_packet(&self, pipe_id: u32) -> Result<Vec<u8>> {
        let mut locked = self.find_pipe(pipe_id)?;
        loop {
            if let Some(packet) = locked.packets.pop_front() {
                let payload = packet.payload().to_vec();
                self.shared.packet_pool.recycle(packet);
                return Ok(payload);
            }

            if !self.shared.running.load(Ordering::SeqCst) {
                return Err(self.shared.take_fatal_error());
            }

            let deadline = deadline_after(self.shared.config.receive_wait_timeout);
            if !locked.wait_receive_until(deadline) {
                let mut loss = SlaveMessage::new(self.shared.node_index, SlaveMessageId::PacketLoss);
                loss.pipe_id = pipe_id;
                loss.stream_pos = locked.stream_pos.get();
                loss.packet_pos = locked.stream_pos.get();
                self.shared.send_slave_burst(&loss);
            }
        }
    }

    /// Collective barrier on `pipe_id`: blocks until every node has called
    /// `barrier` on this pipe with the same (or a later) round number.
    pub fn barrier(&self, pipe_id: u32) -> Result<()> {
        let round = self.find_pipe(pipe_id)?.barrier_id + 1;
        if self.shared.node_index == 0 {
            self.run_master_round(pipe_id, MasterMessageId::Barrier, round)
        } else {
            self.run_slave_round(pipe_id, SlaveMessageId::Barrier, round)
        }
    }

    /// Collective reduction on `pipe_id`: every node contributes `value`,
    /// `op` folds them together (master's value first), and every node
    /// receives the same reduced result.
    pub fn gather(&self, pipe_id: u32, value: u32, op: GatherOp) -> Result<u32> {
        if self.shared.node_index == 0 {
            let round = {
                let mut locked = self.find_pipe(pipe_id)?;
                locked.master_gather_value = value;
                locked.barrier_id + 1
            };
            self.run_master_gather_round(pipe_id, round, op)
        } else {
            let round = self.find_pipe(pipe_id)?.barrier_id + 1;
            let mut announce = SlaveMessage::new(self.shared.node_index, SlaveMessageId::Gather);
            announce.pipe_id = pipe_id;
            announce.barrier_id = round;
            announce.slave_value = value;
            loop {
                if !self.shared.running.load(Ordering::SeqCst) {
                    return Err(self.shared.take_fatal_error());
                }
                self.shared.send_slave_burst(&announce);
                let mut locked = self.find_pipe(pipe_id)?;
                if locked.barrier_id >= round {
                    return Ok(locked.master_gather_value);
                }
                locked.wait_barrier_until(deadline_after(self.shared.config.barrier_wait_timeout));
            }
        }
    }

    fn find_pipe(&self, pipe_id: u32) -> Result<LockedPipe> {
        LockedPipe::find(&self.shared.pipe_table, pipe_id).ok_or(Error::ClosedPipe(pipe_id))
    }

    /// Master side of a create-pipe/barrier round on `channel_pipe`: waits
    /// until every slave has announced round `round` or later, then
    /// broadcasts the release.
    fn run_master_round(&self, channel_pipe: u32, reply_kind: MasterMessageId, round: u32) -> Result<()> {
        let mut locked = self.find_pipe(channel_pipe)?;
        if locked.barrier_id < round {
            locked.barrier_id = round;
        }
        while locked.min_slave_barrier_id < round {
            if !self.shared.running.load(Ordering::SeqCst) {
                return Err(self.shared.take_fatal_error());
            }
            locked.wait_barrier();
        }

        if reply_kind == MasterMessageId::Barrier {
            flush_after_barrier(&self.shared, &mut locked);
        }
        drop(locked);

        let mut reply = MasterMessage::new(reply_kind);
        reply.target_pipe_id = channel_pipe;
        reply.barrier_id = round;
        self.shared.send_master_burst(&reply);
        Ok(())
    }

    fn run_master_gather_round(&self, pipe_id: u32, round: u32, op: GatherOp) -> Result<u32> {
        let mut locked = self.find_pipe(pipe_id)?;
        if locked.barrier_id < round {
            locked.barrier_id = round;
        }
        while locked.min_slave_barrier_id < round {
            if !self.shared.running.load(Ordering::SeqCst) {
                return Err(self.shared.take_fatal_error());
            }
            locked.wait_barrier();
        }

        let mut acc = locked.master_gather_value;
        for &v in locked.slave_gather_values.iter() {
            acc = op.apply(acc, v);
        }
        locked.master_gather_value = acc;

        flush_after_barrier(&self.shared, &mut locked);
        drop(locked);

        let mut reply = MasterMessage::new(MasterMessageId::Gather);
        reply.target_pipe_id = pipe_id;
        reply.barrier_id = round;
        reply.master_value = acc;
        self.shared.send_master_burst(&reply);
        Ok(acc)
    }

    /// Slave side of a create-pipe/barrier round: announces `round` on
    /// `channel_pipe` and retries until the master's release arrives.
    fn run_slave_round(&self, channel_pipe: u32, announce_kind: SlaveMessageId, round: u32) -> Result<()> {
        let mut announce = SlaveMessage::new(self.shared.node_index, announce_kind);
        announce.pipe_id = channel_pipe;
        announce.barrier_id = round;
        loop {
            if !self.shared.running.load(Ordering::SeqCst) {
                return Err(self.shared.take_fatal_error());
            }
            self.shared.send_slave_burst(&announce);
            let mut locked = self.find_pipe(channel_pipe)?;
            if locked.barrier_id >= round {
                return Ok(());
            }
            locked.wait_barrier_until(deadline_after(self.shared.config.barrier_wait_timeout));
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn run_master(shared: Arc<Shared>) {
    let mut recv_buf = vec![0u8; SlaveMessage::WIRE_SIZE];
    let mut slave_connected = vec![false; shared.num_slaves as usize];
    let mut ping_misses = 0u32;

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        let connected = shared.is_connected();
        let timeout = if connected {
            shared.config.ping_timeout
        } else {
            shared.config.connection_wait_timeout
        };
        if let Err(e) = shared.socket.set_read_timeout(Some(timeout)) {
            shared.fail(Error::SocketSetupFailed(e));
            return;
        }

        match shared.socket.recv_from(&mut recv_buf) {
            Ok((len, _src)) => {
                ping_misses = 0;
                handle_slave_message(&shared, &recv_buf[..len], &mut slave_connected);
            }
            Err(e) if is_timeout(&e) => {
                if connected {
                    ping_misses += 1;
                    if ping_misses >= shared.config.max_ping_requests {
                        shared.fail(Error::CommunicationLost { attempts: ping_misses });
                        return;
                    }
                    shared.send_master_burst(&MasterMessage::new(MasterMessageId::Ping));
                }
            }
            Err(e) => {
                shared.fail(Error::ReceiveError(e));
                return;
            }
        }
    }
}

fn run_slave(shared: Arc<Shared>) {
    let mut recv_buf = vec![0u8; MAX_PACKET_SIZE + DATA_HEADER_SIZE];
    let mut ping_misses = 0u32;
    let connect_msg = SlaveMessage::new(shared.node_index, SlaveMessageId::Connection);

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        let connected = shared.is_connected();
        let timeout = if connected {
            shared.config.ping_timeout
        } else {
            shared.config.connection_wait_timeout
        };
        if let Err(e) = shared.socket.set_read_timeout(Some(timeout)) {
            shared.fail(Error::SocketSetupFailed(e));
            return;
        }
        if !connected {
            shared.send_slave_burst(&connect_msg);
        }

        match shared.socket.recv_from(&mut recv_buf) {
            Ok((len, _src)) => {
                ping_misses = 0;
                handle_slave_datagram(&shared, &recv_buf[..len]);
            }
            Err(e) if is_timeout(&e) => {
                if connected {
                    ping_misses += 1;
                    if ping_misses >= shared.config.max_ping_requests {
                        shared.fail(Error::CommunicationLost { attempts: ping_misses });
                        return;
                    }
                    let ping = SlaveMessage::new(shared.node_index, SlaveMessageId::Ping);
                    shared.send_slave_burst(&ping);
                }
            }
            Err(e) => {
                shared.fail(Error::ReceiveError(e));
                return;
            }
        }
    }
}

fn handle_slave_message(shared: &Arc<Shared>, buf: &[u8], slave_connected: &mut [bool]) {
    let msg = match SlaveMessage::decode(buf) {
        Some(m) => m,
        None => {
            warn!("master: dropping malformed datagram");
            return;
        }
    };
    if msg.node_index == 0 || msg.node_index as usize > slave_connected.len() {
        warn!("master: message from out-of-range node index {}", msg.node_index);
        return;
    }
    let idx = (msg.node_index - 1) as usize;

    match msg.message_id {
        SlaveMessageId::Connection => {
            if !slave_connected[idx] {
                slave_connected[idx] = true;
                info!("master: slave {} connected", msg.node_index);
            }
            shared.send_master_burst(&MasterMessage::new(MasterMessageId::Connection));
            if !shared.is_connected() && slave_connected.iter().all(|&c| c) {
                shared.mark_connected();
                info!("master: all {} slaves connected", slave_connected.len());
            }
        }
        SlaveMessageId::Ping => {}
        SlaveMessageId::CreatePipe => {
            if shared.pipe_table.lookup(msg.pipe_id).is_none() && msg.pipe_id != 0 {
                shared
                    .pipe_table
                    .insert(msg.pipe_id, PipeState::new_master(shared.num_slaves));
            }
            record_slave_round(shared, &msg, MasterMessageId::CreatePipe);
        }
        SlaveMessageId::Acknowledgment => process_acknowledgment(shared, &msg),
        SlaveMessageId::PacketLoss => handle_packet_loss(shared, &msg),
        SlaveMessageId::Barrier => record_slave_round(shared, &msg, MasterMessageId::Barrier),
        SlaveMessageId::Gather => {
            if let Some(mut locked) = LockedPipe::find(&shared.pipe_table, msg.pipe_id) {
                if idx < locked.slave_gather_values.len() {
                    locked.slave_gather_values[idx] = msg.slave_value;
                }
            }
            record_slave_round(shared, &msg, MasterMessageId::Gather);
        }
    }
}

/// Records that slave `msg.node_index` has reached round `msg.barrier_id`
/// on pipe `msg.pipe_id`, waking any blocked `barrier`/`gather`/`open_pipe`
/// caller. If the round is one the master has already finished, resends
/// the release right away instead of waiting for the slave's own retry
/// timer to eventually see it — this is what makes the protocol idempotent
/// under a lost release message.
fn record_slave_round(shared: &Arc<Shared>, msg: &SlaveMessage, reply_kind: MasterMessageId) {
    let idx = match (msg.node_index as usize).checked_sub(1) {
        Some(i) => i,
        None => return,
    };
    let mut locked = match LockedPipe::find(&shared.pipe_table, msg.pipe_id) {
        Some(l) => l,
        None => return,
    };
    if idx >= locked.slave_barrier_ids.len() {
        return;
    }
    if locked.slave_barrier_ids[idx] < msg.barrier_id {
        locked.slave_barrier_ids[idx] = msg.barrier_id;
        locked.recompute_min_slave_barrier_id();
        locked.notify_barrier();
    }
    if locked.barrier_id >= msg.barrier_id {
        let mut reply = MasterMessage::new(reply_kind);
        reply.target_pipe_id = msg.pipe_id;
        reply.barrier_id = locked.barrier_id;
        reply.master_value = locked.master_gather_value;
        drop(locked);
        shared.send_master_burst(&reply);
    }
}

fn process_acknowledgment(shared: &Arc<Shared>, msg: &SlaveMessage) {
    let idx = match (msg.node_index as usize).checked_sub(1) {
        Some(i) => i,
        None => return,
    };
    let mut locked = match LockedPipe::find(&shared.pipe_table, msg.pipe_id) {
        Some(l) => l,
        None => return,
    };
    if idx >= locked.slave_stream_pos_offsets.len() {
        return;
    }

    // Assumes the slave's reported stream_pos only ever increases between
    // acknowledgments for a given pipe (an Open Question in the design
    // this is grounded on; see DESIGN.md).
    let offset = StreamPos::new(msg.stream_pos) - locked.head_stream_pos;
    let was_head = locked.slave_stream_pos_offsets[idx] == 0;
    locked.slave_stream_pos_offsets[idx] = offset;
    if was_head && offset != 0 {
        locked.num_head_slaves = locked.num_head_slaves.saturating_sub(1);
    }

    if locked.num_head_slaves == 0 {
        let min_offset = locked
            .slave_stream_pos_offsets
            .iter()
            .copied()
            .min()
            .unwrap_or(0);
        if min_offset > 0 {
            let new_head = locked.head_stream_pos + min_offset;
            let popped = locked
                .packets
                .pop_front_while(|p| !(p.stream_pos + p.payload_size()).is_ahead_of(new_head));
            locked.head_stream_pos = new_head;
            for off in locked.slave_stream_pos_offsets.iter_mut() {
                *off -= min_offset;
            }
            locked.num_head_slaves = locked
                .slave_stream_pos_offsets
                .iter()
                .filter(|&&o| o == 0)
                .count() as u32;
            locked.notify_receive();
            drop(locked);
            shared.packet_pool.recycle_all(popped);
        }
    }
}

/// Flushes every packet the master is still retaining for a pipe back to
/// the pool and resets flow control to start fresh from the current stream
/// position. Called once every slave has reached a barrier or gather round,
/// since a round boundary guarantees every slave has consumed everything
/// sent before it — retaining those packets past the round only wastes
/// `send_buffer_size` headroom and leaves `head_stream_pos` stale. Not used
/// for the pipe-creation round on pipe 0, which carries no data traffic to
/// flush.
fn flush_after_barrier(shared: &Arc<Shared>, locked: &mut LockedPipe) {
    locked.packets.drain_to_pool(&shared.packet_pool);
    locked.head_stream_pos = locked.stream_pos;
    for off in locked.slave_stream_pos_offsets.iter_mut() {
        *off = 0;
    }
    locked.num_head_slaves = shared.num_slaves;
}

fn handle_packet_loss(shared: &Arc<Shared>, msg: &SlaveMessage) {
    // A NAK also tells the master the slave has received everything up to
    // `stream_pos`; treat it as an acknowledgment before retransmitting, or
    // a slave that only ever NAKs (never hits the sampled ack boundary)
    // would stall the master's flow control.
    process_acknowledgment(shared, msg);

    let locked = match LockedPipe::find(&shared.pipe_table, msg.pipe_id) {
        Some(l) => l,
        None => return,
    };
    let requested = StreamPos::new(msg.stream_pos);

    let found = locked.packets.iter().any(|p| p.stream_pos == requested);
    if !found {
        let gap = locked.head_stream_pos.get().wrapping_sub(requested.get());
        drop(locked);
        shared.fail(Error::FatalPacketLoss { gap });
        return;
    }

    let resend: Vec<Vec<u8>> = locked
        .packets
        .iter()
        .filter(|p| p.stream_pos == requested || p.stream_pos.is_ahead_of(requested))
        .map(|p| {
            let mut wire = Vec::with_capacity(DATA_HEADER_SIZE + p.payload().len());
            wire.extend_from_slice(&wire::encode_data_header(p.pipe_id, p.stream_pos.get()));
            wire.extend_from_slice(p.payload());
            wire
        })
        .collect();
    drop(locked);

    for wire in resend {
        shared.send_to(&wire);
    }
}

fn handle_slave_datagram(shared: &Arc<Shared>, buf: &[u8]) {
    match wire::decode_pipe_id(buf) {
        Some(0) => match MasterMessage::decode(buf) {
            Some(msg) => handle_master_message(shared, &msg),
            None => warn!("slave: malformed control message"),
        },
        Some(_pipe_id) => match wire::decode_data_header(buf) {
            Some((pipe_id, stream_pos)) => {
                handle_data_packet(shared, pipe_id, StreamPos::new(stream_pos), &buf[DATA_HEADER_SIZE..]);
            }
            None => warn!("slave: malformed data packet"),
        },
        None => warn!("slave: short datagram"),
    }
}

fn handle_master_message(shared: &Arc<Shared>, msg: &MasterMessage) {
    match msg.message_id {
        MasterMessageId::Connection => shared.mark_connected(),
        MasterMessageId::Ping => {}
        MasterMessageId::CreatePipe | MasterMessageId::Barrier | MasterMessageId::Gather => {
            if let Some(mut locked) = LockedPipe::find(&shared.pipe_table, msg.target_pipe_id) {
                if msg.barrier_id > locked.barrier_id {
                    locked.barrier_id = msg.barrier_id;
                    if msg.message_id == MasterMessageId::Gather {
                        locked.master_gather_value = msg.master_value;
                    }
                    locked.notify_barrier();
                }
            }
        }
    }
}

fn handle_data_packet(shared: &Arc<Shared>, pipe_id: u32, stream_pos: StreamPos, payload: &[u8]) {
    let mut locked = match LockedPipe::find(&shared.pipe_table, pipe_id) {
        Some(l) => l,
        None => return,
    };

    if stream_pos == locked.stream_pos {
        locked.packet_loss_mode = false;

        let mut packet = shared.packet_pool.take();
        packet.pipe_id = pipe_id;
        packet.stream_pos = stream_pos;
        packet.set_payload(payload);
        locked.stream_pos += payload.len() as u32;
        locked.packets.push_back(packet);
        locked.notify_receive();

        locked.ack_counter = locked.ack_counter.wrapping_add(1);
        if locked.ack_counter % shared.num_slaves.max(1) == 0 {
            let mut ack = SlaveMessage::new(shared.node_index, SlaveMessageId::Acknowledgment);
            ack.pipe_id = pipe_id;
            ack.stream_pos = locked.stream_pos.get();
            shared.send_slave_burst(&ack);
        }
    } else if stream_pos.is_ahead_of(locked.stream_pos) {
        if !locked.packet_loss_mode {
            locked.packet_loss_mode = true;
            let mut loss = SlaveMessage::new(shared.node_index, SlaveMessageId::PacketLoss);
            loss.pipe_id = pipe_id;
            loss.stream_pos = locked.stream_pos.get();
            loss.packet_pos = stream_pos.get();
            shared.send_slave_burst(&loss);
        }
    }
    // else: stream_pos is behind current, a stale retransmit of an
    // already-delivered packet — discard silently.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builders_override_defaults() {
        let config = Config::default()
            .with_ping_timeout(Duration::from_secs(1))
            .with_max_ping_requests(5)
            .with_send_buffer_size(10);
        assert_eq!(config.ping_timeout, Duration::from_secs(1));
        assert_eq!(config.max_ping_requests, 5);
        assert_eq!(config.send_buffer_size, 10);
        assert_eq!(config.connection_wait_timeout, Config::default().connection_wait_timeout);
    }

    #[test]
    fn timeout_errors_are_recognized() {
        let would_block = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        let other = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(is_timeout(&would_block));
        assert!(is_timeout(&timed_out));
        assert!(!is_timeout(&other));
    }
}
