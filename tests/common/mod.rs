//! Deterministic in-memory host stack for exercising the splice proxy and
//! the sender-side controller contract.
//!
//! `SimStack` models the cooperative single-threaded executor of the host
//! simulator: socket operations enqueue events, `pump` drains them until the
//! network is quiescent, and callbacks never preempt each other. `MockSender`
//! scripts the sender-side inputs (flight, RTT, RTO, state) and counts the
//! base-sender actions a controller commands.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tcp_workbench::error::SocketError;
use tcp_workbench::sender::{SenderHost, SeqNumber, TcpState};
use tcp_workbench::socket::{
    AcceptFilter, ClosedFn, EstablishedFn, RecvFn, SendFn, SocketHandle, SocketId, StackHost,
    StreamSocket,
};

pub const DEFAULT_BUF: usize = 64 * 1024;

/// Scripted sender-side surface with action counters.
pub struct MockSender {
    pub flight: u32,
    pub last_rtt: Duration,
    pub rto: Duration,
    pub state: TcpState,
    pub head: SeqNumber,
    pub high_tx: SeqNumber,
    pub acked: Vec<SeqNumber>,
    pub restarts: u32,
    pub retransmits: u32,
    pub rto_doublings: u32,
    pub send_pendings: u32,
}

impl Default for MockSender {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSender {
    pub fn new() -> Self {
        Self {
            flight: 0,
            last_rtt: Duration::from_millis(100),
            rto: Duration::from_secs(1),
            state: TcpState::Established,
            head: SeqNumber(0),
            high_tx: SeqNumber(0),
            acked: Vec::new(),
            restarts: 0,
            retransmits: 0,
            rto_doublings: 0,
            send_pendings: 0,
        }
    }
}

impl SenderHost for MockSender {
    fn bytes_in_flight(&self) -> u32 {
        self.flight
    }

    fn last_rtt(&self) -> Duration {
        self.last_rtt
    }

    fn rto(&self) -> Duration {
        self.rto
    }

    fn state(&self) -> TcpState {
        self.state
    }

    fn head_sequence(&self) -> SeqNumber {
        self.head
    }

    fn high_tx_mark(&self) -> SeqNumber {
        self.high_tx
    }

    fn advance_ack(&mut self, seq: SeqNumber) {
        self.acked.push(seq);
        self.head = self.head.max(seq);
    }

    fn restart_from_head(&mut self) {
        self.restarts += 1;
    }

    fn retransmit_head(&mut self) {
        self.retransmits += 1;
    }

    fn double_rto(&mut self) {
        self.rto_doublings += 1;
        self.rto = self.rto.saturating_mul(2);
    }

    fn send_pending(&mut self) {
        self.send_pendings += 1;
    }
}

enum SimEvent {
    /// Move queued tx bytes from this socket toward its peer.
    Transfer(SocketId),
    RecvReady(SocketId),
    SendReady(SocketId, usize),
    /// The peer of this socket closed and its inbound bytes are drained.
    PeerClosed(SocketId),
}

pub struct SimStack {
    self_weak: Weak<RefCell<SimStack>>,
    next_id: u64,
    sockets: HashMap<SocketId, Rc<RefCell<SimSocket>>>,
    listeners: HashMap<SocketAddrV4, SocketId>,
    events: VecDeque<SimEvent>,
    default_rx: usize,
    default_tx: usize,
    /// Every connect attempt, in order, with its target.
    pub connect_log: Vec<(SocketId, SocketAddrV4)>,
}

impl SimStack {
    pub fn new_shared() -> Rc<RefCell<SimStack>> {
        Self::with_buffers(DEFAULT_BUF, DEFAULT_BUF)
    }

    pub fn with_buffers(rx: usize, tx: usize) -> Rc<RefCell<SimStack>> {
        let stack = Rc::new(RefCell::new(SimStack {
            self_weak: Weak::new(),
            next_id: 1,
            sockets: HashMap::new(),
            listeners: HashMap::new(),
            events: VecDeque::new(),
            default_rx: rx,
            default_tx: tx,
            connect_log: Vec::new(),
        }));
        stack.borrow_mut().self_weak = Rc::downgrade(&stack);
        stack
    }

    fn create(&mut self) -> Rc<RefCell<SimSocket>> {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        let sock = Rc::new(RefCell::new(SimSocket::new(
            id,
            self.self_weak.clone(),
            self.default_rx,
            self.default_tx,
        )));
        self.sockets.insert(id, sock.clone());
        sock
    }

    pub fn spawn(stack: &Rc<RefCell<SimStack>>) -> Rc<RefCell<SimSocket>> {
        stack.borrow_mut().create()
    }

    pub fn sim_socket(
        stack: &Rc<RefCell<SimStack>>,
        id: SocketId,
    ) -> Option<Rc<RefCell<SimSocket>>> {
        stack.borrow().sockets.get(&id).cloned()
    }

    pub fn listener_count(stack: &Rc<RefCell<SimStack>>) -> usize {
        stack.borrow().listeners.len()
    }
}

impl StackHost for SimStack {
    fn create_socket(&mut self) -> SocketHandle {
        self.create()
    }
}

pub struct SimSocket {
    id: SocketId,
    stack: Weak<RefCell<SimStack>>,
    local: Option<SocketAddrV4>,
    peer_addr: Option<SocketAddrV4>,
    peer: Option<SocketId>,
    listening: bool,
    closed: bool,
    fin_sent: bool,
    peer_fin_pending: bool,
    peer_closed_fired: bool,
    rx_buf: VecDeque<u8>,
    rx_capacity: usize,
    tx_buf: VecDeque<u8>,
    tx_capacity: usize,
    empty_acks: u32,
    accept_filter: Option<AcceptFilter>,
    established_cb: Option<EstablishedFn>,
    recv_cb: Option<RecvFn>,
    send_cb: Option<SendFn>,
    close_cb: Option<ClosedFn>,
}

impl SimSocket {
    fn new(id: SocketId, stack: Weak<RefCell<SimStack>>, rx: usize, tx: usize) -> Self {
        Self {
            id,
            stack,
            local: None,
            peer_addr: None,
            peer: None,
            listening: false,
            closed: false,
            fin_sent: false,
            peer_fin_pending: false,
            peer_closed_fired: false,
            rx_buf: VecDeque::new(),
            rx_capacity: rx,
            tx_capacity: tx,
            tx_buf: VecDeque::new(),
            empty_acks: 0,
            accept_filter: None,
            established_cb: None,
            recv_cb: None,
            send_cb: None,
            close_cb: None,
        }
    }

    pub fn peer_id(&self) -> Option<SocketId> {
        self.peer
    }

    /// Bare ACK segments emitted on this socket.
    pub fn empty_acks(&self) -> u32 {
        self.empty_acks
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn push_event(&self, ev: SimEvent) {
        if let Some(stack) = self.stack.upgrade() {
            stack.borrow_mut().events.push_back(ev);
        }
    }
}

impl StreamSocket for SimSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn bind(&mut self, addr: SocketAddrV4) -> Result<(), SocketError> {
        self.local = Some(addr);
        Ok(())
    }

    fn listen(&mut self) -> Result<(), SocketError> {
        let local = self.local.ok_or(SocketError::InvalidState)?;
        let stack = self.stack.upgrade().ok_or(SocketError::InvalidState)?;
        let mut st = stack.borrow_mut();
        if st.listeners.contains_key(&local) {
            return Err(SocketError::AddressInUse);
        }
        st.listeners.insert(local, self.id);
        self.listening = true;
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddrV4) -> Result<(), SocketError> {
        let stack = self.stack.upgrade().ok_or(SocketError::InvalidState)?;
        stack.borrow_mut().connect_log.push((self.id, addr));

        if self.local.is_none() {
            // Ephemeral local endpoint for unbound active opens.
            let port = 49152u16.wrapping_add(self.id.0 as u16);
            self.local = Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 254), port));
        }
        let from = self.local.ok_or(SocketError::InvalidState)?;

        let listener_id = {
            let st = stack.borrow();
            st.listeners.get(&addr).copied().or_else(|| {
                st.listeners
                    .get(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port()))
                    .copied()
            })
        };
        let Some(listener_id) = listener_id else {
            return Err(SocketError::ConnectionRefused);
        };
        let listener = stack
            .borrow()
            .sockets
            .get(&listener_id)
            .cloned()
            .ok_or(SocketError::ConnectionRefused)?;

        let mut filter = listener.borrow_mut().accept_filter.take();
        let admitted = match filter.as_mut() {
            Some(f) => f(from),
            None => true,
        };
        listener.borrow_mut().accept_filter = filter;
        if !admitted {
            return Err(SocketError::ConnectionRefused);
        }

        let accepted = stack.borrow_mut().create();
        {
            let mut a = accepted.borrow_mut();
            a.local = Some(addr);
            a.peer_addr = Some(from);
            a.peer = Some(self.id);
        }
        self.peer = Some(accepted.borrow().id());
        self.peer_addr = Some(addr);

        let mut established = listener.borrow_mut().established_cb.take();
        if let Some(cb) = established.as_mut() {
            cb(accepted.clone(), from);
        }
        listener.borrow_mut().established_cb = established;
        Ok(())
    }

    fn close(&mut self) {
        if self.listening {
            if let Some(stack) = self.stack.upgrade() {
                let id = self.id;
                stack.borrow_mut().listeners.retain(|_, v| *v != id);
            }
            self.listening = false;
            self.closed = true;
            return;
        }
        if self.closed {
            return;
        }
        self.closed = true;
        // Flush remaining bytes, then deliver the FIN.
        self.push_event(SimEvent::Transfer(self.id));
    }

    fn rx_available(&self) -> usize {
        self.rx_buf.len()
    }

    fn tx_available(&self) -> usize {
        if self.closed {
            0
        } else {
            self.tx_capacity - self.tx_buf.len()
        }
    }

    fn advertised_window(&self) -> usize {
        self.rx_capacity - self.rx_buf.len()
    }

    fn recv(&mut self, max_bytes: usize) -> Vec<u8> {
        let n = max_bytes.min(self.rx_buf.len());
        let out: Vec<u8> = self.rx_buf.drain(..n).collect();
        if n > 0 {
            if let Some(pid) = self.peer {
                // Window opened; the peer may push more.
                self.push_event(SimEvent::Transfer(pid));
            }
            if self.peer_fin_pending && self.rx_buf.is_empty() && !self.peer_closed_fired {
                self.push_event(SimEvent::PeerClosed(self.id));
            }
        }
        out
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, SocketError> {
        if self.closed {
            return Err(SocketError::Closed);
        }
        if self.peer.is_none() {
            return Err(SocketError::NotConnected);
        }
        let space = self.tx_capacity - self.tx_buf.len();
        let n = space.min(data.len());
        self.tx_buf.extend(&data[..n]);
        if n > 0 {
            self.push_event(SimEvent::Transfer(self.id));
        }
        Ok(n)
    }

    fn send_empty_ack(&mut self) {
        self.empty_acks += 1;
        if let Some(pid) = self.peer {
            // The bare ACK re-advertises our window; the peer re-evaluates
            // its queued data.
            self.push_event(SimEvent::Transfer(pid));
        }
    }

    fn peer(&self) -> Option<SocketAddrV4> {
        self.peer_addr
    }

    fn set_accept_callback(&mut self, filter: AcceptFilter, established: EstablishedFn) {
        self.accept_filter = Some(filter);
        self.established_cb = Some(established);
    }

    fn set_recv_callback(&mut self, cb: RecvFn) {
        self.recv_cb = Some(cb);
    }

    fn set_send_callback(&mut self, cb: SendFn) {
        self.send_cb = Some(cb);
    }

    fn set_close_callback(&mut self, cb: ClosedFn) {
        self.close_cb = Some(cb);
    }
}

/// Drain the event queue until the network is quiescent.
pub fn pump(stack: &Rc<RefCell<SimStack>>) {
    loop {
        let ev = stack.borrow_mut().events.pop_front();
        let Some(ev) = ev else {
            break;
        };
        dispatch(stack, ev);
    }
}

fn get(stack: &Rc<RefCell<SimStack>>, id: SocketId) -> Option<Rc<RefCell<SimSocket>>> {
    stack.borrow().sockets.get(&id).cloned()
}

fn dispatch(stack: &Rc<RefCell<SimStack>>, ev: SimEvent) {
    match ev {
        SimEvent::Transfer(id) => transfer(stack, id),
        SimEvent::RecvReady(id) => {
            let Some(sock) = get(stack, id) else { return };
            // A closed socket's pending callbacks are cancelled.
            if sock.borrow().closed || sock.borrow().rx_buf.is_empty() {
                return;
            }
            let cb = sock.borrow_mut().recv_cb.take();
            if let Some(mut cb) = cb {
                cb(id);
                let mut s = sock.borrow_mut();
                if s.recv_cb.is_none() {
                    s.recv_cb = Some(cb);
                }
            }
        }
        SimEvent::SendReady(id, available) => {
            let Some(sock) = get(stack, id) else { return };
            if sock.borrow().closed || available == 0 {
                return;
            }
            let cb = sock.borrow_mut().send_cb.take();
            if let Some(mut cb) = cb {
                cb(id, available);
                let mut s = sock.borrow_mut();
                if s.send_cb.is_none() {
                    s.send_cb = Some(cb);
                }
            }
        }
        SimEvent::PeerClosed(id) => {
            let Some(sock) = get(stack, id) else { return };
            if sock.borrow().peer_closed_fired {
                return;
            }
            sock.borrow_mut().peer_closed_fired = true;
            let cb = sock.borrow_mut().close_cb.take();
            if let Some(mut cb) = cb {
                cb(id);
                let mut s = sock.borrow_mut();
                if s.close_cb.is_none() {
                    s.close_cb = Some(cb);
                }
            }
        }
    }
}

fn transfer(stack: &Rc<RefCell<SimStack>>, id: SocketId) {
    let Some(sock) = get(stack, id) else { return };
    let Some(pid) = sock.borrow().peer else {
        return;
    };
    let Some(peer) = get(stack, pid) else { return };

    let (moved, fin_delivered) = {
        let mut s = sock.borrow_mut();
        let mut p = peer.borrow_mut();
        let space = p.rx_capacity - p.rx_buf.len();
        let moved = space.min(s.tx_buf.len());
        for _ in 0..moved {
            let byte = s.tx_buf.pop_front().unwrap();
            p.rx_buf.push_back(byte);
        }
        let mut fin_delivered = false;
        if s.closed && s.tx_buf.is_empty() && !s.fin_sent {
            s.fin_sent = true;
            p.peer_fin_pending = true;
            if p.rx_buf.is_empty() {
                fin_delivered = true;
            }
        }
        (moved, fin_delivered)
    };

    let mut st = stack.borrow_mut();
    if moved > 0 {
        st.events.push_back(SimEvent::RecvReady(pid));
        st.events.push_back(SimEvent::SendReady(id, moved));
    }
    if fin_delivered {
        st.events.push_back(SimEvent::PeerClosed(pid));
    }
}

/// A server application that accepts one connection and reads everything
/// thrown at it, unless paused.
pub struct SinkApp {
    pub received: Vec<u8>,
    pub paused: bool,
    pub closed: bool,
    pub socket: Option<SocketHandle>,
}

impl SinkApp {
    pub fn listen(stack: &Rc<RefCell<SimStack>>, addr: SocketAddrV4) -> Rc<RefCell<SinkApp>> {
        let app = Rc::new(RefCell::new(SinkApp {
            received: Vec::new(),
            paused: false,
            closed: false,
            socket: None,
        }));

        let listener = SimStack::spawn(stack);
        listener.borrow_mut().bind(addr).unwrap();

        let est_app = Rc::downgrade(&app);
        let established: EstablishedFn = Box::new(move |sock, _from| {
            let Some(app) = est_app.upgrade() else { return };
            app.borrow_mut().socket = Some(sock.clone());

            let recv_app = Rc::downgrade(&app);
            let recv_sock = sock.clone();
            sock.borrow_mut().set_recv_callback(Box::new(move |_| {
                if let Some(app) = recv_app.upgrade() {
                    SinkApp::drain(&app, &recv_sock);
                }
            }));

            let close_app = Rc::downgrade(&app);
            sock.borrow_mut().set_close_callback(Box::new(move |_| {
                if let Some(app) = close_app.upgrade() {
                    app.borrow_mut().closed = true;
                }
            }));
        });

        listener
            .borrow_mut()
            .set_accept_callback(Box::new(|_| true), established);
        listener.borrow_mut().listen().unwrap();
        app
    }

    pub fn drain(app: &Rc<RefCell<SinkApp>>, sock: &SocketHandle) {
        loop {
            if app.borrow().paused {
                return;
            }
            let available = sock.borrow().rx_available();
            if available == 0 {
                return;
            }
            let data = sock.borrow_mut().recv(available);
            app.borrow_mut().received.extend_from_slice(&data);
        }
    }

    pub fn resume(app: &Rc<RefCell<SinkApp>>) {
        app.borrow_mut().paused = false;
        let sock = app.borrow().socket.clone();
        if let Some(sock) = sock {
            Self::drain(app, &sock);
        }
    }
}
