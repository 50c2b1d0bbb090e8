use crate::error::SocketError;
use crate::socket::{
    AcceptFilter, ClosedFn, EstablishedFn, HostHandle, SocketHandle, SocketId, StreamSocket,
};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;
use tracing::{debug, warn};

/// A receive window below one minimum segment cannot make progress; the
/// relay treats it as closed and arms the stagnation escape.
pub const MIN_SEGMENT: usize = 536;

/// A transparent bidirectional TCP splice.
///
/// The proxy listens on one port, admits inbound connections whose peer
/// address appears in its pairing table, opens a matching outbound
/// connection, and relays bytes both ways while honoring receive-window and
/// send-buffer back-pressure. Relaying is driven symmetrically from the
/// receive-ready and send-ready callbacks of both legs, so a direction that
/// stalls on back-pressure resumes without polling as soon as the pressure
/// lifts.
pub struct SpliceProxy {
    port: u16,
    /// Peer address -> where a connection from that peer gets spliced to.
    /// Both directions of a pairing are recorded.
    pair_map: HashMap<Ipv4Addr, SocketAddrV4>,
    /// Accepted inbound sockets; `backward[i]` is the outbound leg opened
    /// for `forward[i]`. Partner lookup is by id over these two parallel
    /// tables.
    forward: SmallVec<[SocketHandle; 4]>,
    backward: SmallVec<[SocketHandle; 4]>,
    listener: Option<SocketHandle>,
    /// Latched when a destination ran out of send buffer while the source
    /// advertised window had collapsed; cleared by the remedial empty ACK.
    is_stagnant: bool,
    started: bool,
}

impl Default for SpliceProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl SpliceProxy {
    pub fn new() -> Self {
        Self {
            port: 0,
            pair_map: HashMap::new(),
            forward: SmallVec::new(),
            backward: SmallVec::new(),
            listener: None,
            is_stagnant: false,
            started: false,
        }
    }

    pub fn set_port(&mut self, port: u16) {
        assert!(
            !self.started,
            "SpliceProxy::set_port: cannot change the listen port after the proxy started"
        );
        self.port = port;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Register that connections from `client` are spliced to
    /// `server:server_port`, and connections from `server` back to
    /// `client:client_port`. Re-adding a pairing is idempotent.
    pub fn add_pair(
        &mut self,
        client: Ipv4Addr,
        client_port: u16,
        server: Ipv4Addr,
        server_port: u16,
    ) {
        self.pair_map
            .insert(client, SocketAddrV4::new(server, server_port));
        self.pair_map
            .insert(server, SocketAddrV4::new(client, client_port));
    }

    pub fn pair_count(&self) -> usize {
        self.pair_map.len()
    }

    /// Number of live spliced conversations.
    pub fn conn_count(&self) -> usize {
        self.forward.len()
    }

    pub fn is_stagnant(&self) -> bool {
        self.is_stagnant
    }

    /// Bind the listen port, install the accept filter and the
    /// connection-established handler, and start listening.
    pub fn start(proxy: &Rc<RefCell<Self>>, host: &HostHandle) -> Result<(), SocketError> {
        let port = proxy.borrow().port;
        let listener = host.borrow_mut().create_socket();
        listener
            .borrow_mut()
            .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;

        // Admission is keyed on the peer's address only; the source port
        // is whatever ephemeral the peer picked.
        let filter_proxy = Rc::downgrade(proxy);
        let filter: AcceptFilter = Box::new(move |from| {
            filter_proxy
                .upgrade()
                .is_some_and(|p| p.borrow().pair_map.contains_key(from.ip()))
        });

        let est_proxy = Rc::downgrade(proxy);
        let est_host = Rc::downgrade(host);
        let established: EstablishedFn = Box::new(move |inbound, from| {
            if let (Some(proxy), Some(host)) = (est_proxy.upgrade(), est_host.upgrade()) {
                Self::on_established(&proxy, &host, inbound, from);
            }
        });

        listener.borrow_mut().set_accept_callback(filter, established);
        listener.borrow_mut().listen()?;

        let mut p = proxy.borrow_mut();
        p.listener = Some(listener);
        p.started = true;
        debug!(port, "splice proxy listening");
        Ok(())
    }

    /// Close the listener. Accepted conversations drain naturally.
    pub fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.borrow_mut().close();
        }
        self.started = false;
    }

    fn on_established(
        proxy: &Rc<RefCell<Self>>,
        host: &HostHandle,
        inbound: SocketHandle,
        from: SocketAddrV4,
    ) {
        let Some(target) = proxy.borrow().pair_map.get(from.ip()).copied() else {
            // The filter admits only mapped peers, so a miss here means the
            // pairing was removed mid-handshake. Nothing to splice to.
            warn!(%from, "no pairing for established connection, dropping");
            return;
        };

        let outbound = host.borrow_mut().create_socket();
        if let Err(err) = outbound.borrow_mut().connect(target) {
            warn!(%from, %target, %err, "splice connect failed, dropping inbound");
            return;
        }
        debug!(%from, %target, "spliced");

        Self::install_callbacks(proxy, &inbound);
        Self::install_callbacks(proxy, &outbound);

        let mut p = proxy.borrow_mut();
        p.forward.push(inbound);
        p.backward.push(outbound);
    }

    fn install_callbacks(proxy: &Rc<RefCell<Self>>, sock: &SocketHandle) {
        let recv_proxy = Rc::downgrade(proxy);
        sock.borrow_mut().set_recv_callback(Box::new(move |sid| {
            if let Some(p) = recv_proxy.upgrade() {
                let (sock, partner) = p.borrow().partner(sid);
                Self::relay(&p, &sock, &partner);
            }
        }));

        let send_proxy = Rc::downgrade(proxy);
        sock.borrow_mut()
            .set_send_callback(Box::new(move |sid, _available| {
                if let Some(p) = send_proxy.upgrade() {
                    let (sock, partner) = p.borrow().partner(sid);
                    // Space freed on `sid`: it is the destination now.
                    Self::relay(&p, &partner, &sock);
                }
            }));

        let close_proxy = Rc::downgrade(proxy);
        let close_cb: ClosedFn = Box::new(move |sid| {
            if let Some(p) = close_proxy.upgrade() {
                Self::on_peer_closed(&p, sid);
            }
        });
        sock.borrow_mut().set_close_callback(close_cb);
    }

    /// Resolve a callback's socket and its spliced partner.
    fn partner(&self, sid: SocketId) -> (SocketHandle, SocketHandle) {
        for (i, sock) in self.forward.iter().enumerate() {
            if sock.borrow().id() == sid {
                return (sock.clone(), self.backward[i].clone());
            }
        }
        for (i, sock) in self.backward.iter().enumerate() {
            if sock.borrow().id() == sid {
                return (sock.clone(), self.forward[i].clone());
            }
        }
        panic!("splice callback for {sid} which is not in the connection table");
    }

    /// Move bytes from `src` to `dst` until one side blocks.
    fn relay(proxy: &Rc<RefCell<Self>>, src: &SocketHandle, dst: &SocketHandle) {
        loop {
            let available = src.borrow().rx_available();
            if available == 0 {
                return;
            }

            let space = dst.borrow().tx_available();
            if space == 0 {
                // Destination is full. If our own advertised window has
                // collapsed too, the peer will stop sending ACKs that
                // could reopen it; remember to nudge it once we drain.
                if src.borrow().advertised_window() < MIN_SEGMENT {
                    proxy.borrow_mut().is_stagnant = true;
                }
                return;
            }

            let data = src.borrow_mut().recv(space);
            let received = data.len();
            if received == 0 {
                return;
            }

            let delivered = match dst.borrow_mut().send(&data) {
                Ok(n) => n,
                Err(err) => {
                    warn!(%err, "splice send failed");
                    return;
                }
            };

            if delivered == received {
                let was_stagnant = std::mem::take(&mut proxy.borrow_mut().is_stagnant);
                if was_stagnant {
                    debug!("window reopened, nudging stalled peer");
                    src.borrow_mut().send_empty_ack();
                }
            } else {
                warn!(received, delivered, "splice delivered fewer bytes than read");
            }
        }
    }

    /// Peer of `sid` closed and its inbound bytes are drained: close the
    /// partner leg and retire the pair.
    fn on_peer_closed(proxy: &Rc<RefCell<Self>>, sid: SocketId) {
        let (sock, partner) = proxy.borrow().partner(sid);
        // Push any remaining bytes through before tearing down.
        Self::relay(proxy, &sock, &partner);
        partner.borrow_mut().close();
        sock.borrow_mut().close();

        let mut p = proxy.borrow_mut();
        if let Some(i) = p
            .forward
            .iter()
            .position(|s| s.borrow().id() == sid || partner.borrow().id() == s.borrow().id())
        {
            p.forward.remove(i);
            p.backward.remove(i);
        }
        debug!(%sid, "splice pair retired");
    }
}
