//! Network glue: sockets, the event loop, and the server core
//!
//! Owns what the core deliberately does not: TCP streams, per-connection
//! write buffers, and the mapping from file descriptors to client ids.
//! Handlers registered on the event loop call into `Server` and then
//! apply whatever [`PostAction`]s the core queued (block timers, wakes,
//! shutdown).

use super::resp::{parse_request, ParseResult};
use super::{PostAction, Server};
use crate::event::{EventLoop, TimerNext, READABLE, WRITABLE};
use crate::ClientId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use tracing::{debug, error, info, warn};

struct Net {
    listener: TcpListener,
    streams: HashMap<RawFd, TcpStream>,
    by_fd: HashMap<RawFd, ClientId>,
    fd_of: HashMap<ClientId, RawFd>,
    /// Bytes accepted by the kernel later than we produced them.
    pending_out: HashMap<RawFd, Vec<u8>>,
}

type NetRef = Rc<RefCell<Net>>;

/// Bind, wire up the event loop, and serve until SHUTDOWN.
pub fn run(server: &mut Server) -> io::Result<()> {
    let addr = format!("{}:{}", server.config.bind, server.config.port);
    let listener = TcpListener::bind(&addr)?;
    listener.set_nonblocking(true)?;
    let listen_fd = listener.as_raw_fd();
    info!("listening on {addr}");

    let mut el: EventLoop<Server> = EventLoop::new(1024)?;
    let net: NetRef = Rc::new(RefCell::new(Net {
        listener,
        streams: HashMap::new(),
        by_fd: HashMap::new(),
        fd_of: HashMap::new(),
        pending_out: HashMap::new(),
    }));

    {
        let net = net.clone();
        el.create_file_event(
            listen_fd,
            READABLE,
            Rc::new(move |server, el, _fd, _mask| accept_ready(&net, server, el)),
        )?;
    }

    {
        let net = net.clone();
        el.create_time_event(
            1,
            Rc::new(move |server: &mut Server, el: &mut EventLoop<Server>, _id| {
                let period = server.cron();
                apply_actions(&net, server, el);
                TimerNext::AfterMs(period)
            }),
            None,
        );
    }

    {
        let net = net.clone();
        el.set_before_sleep(Rc::new(move |server, el| {
            server.serve_ready_keys();
            apply_actions(&net, server, el);
        }));
    }

    el.run(server);
    info!("event loop stopped, closing {} connections", net.borrow().streams.len());
    Ok(())
}

fn accept_ready(net: &NetRef, server: &mut Server, el: &mut EventLoop<Server>) {
    loop {
        let accepted = net.borrow().listener.accept();
        match accepted {
            Ok((stream, peer)) => {
                if server.clients.len() >= server.config.max_clients {
                    warn!("max clients reached, refusing {peer}");
                    continue;
                }
                if let Err(e) = stream.set_nonblocking(true) {
                    error!("set_nonblocking: {e}");
                    continue;
                }
                let _ = stream.set_nodelay(true);
                let fd = stream.as_raw_fd();
                let id = server.create_client(fd);
                {
                    let mut n = net.borrow_mut();
                    n.streams.insert(fd, stream);
                    n.by_fd.insert(fd, id);
                    n.fd_of.insert(id, fd);
                }
                let net = net.clone();
                let res = el.create_file_event(
                    fd,
                    READABLE,
                    Rc::new(move |server, el, fd, _mask| readable(&net, server, el, fd)),
                );
                if let Err(e) = res {
                    error!("register fd {fd}: {e}");
                }
                debug!("accepted {peer} as client {id}");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!("accept: {e}");
                break;
            }
        }
    }
}

fn readable(net: &NetRef, server: &mut Server, el: &mut EventLoop<Server>, fd: RawFd) {
    let Some(id) = net.borrow().by_fd.get(&fd).copied() else {
        el.delete_file_event(fd, READABLE | WRITABLE);
        return;
    };
    let mut chunk = [0u8; 16 * 1024];
    let mut closed = false;
    loop {
        let read = {
            let mut nb = net.borrow_mut();
            let Some(stream) = nb.streams.get_mut(&fd) else {
                closed = true;
                break;
            };
            stream.read(&mut chunk)
        };
        match read {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => {
                if let Some(c) = server.client_mut(id) {
                    c.query.extend_from_slice(&chunk[..n]);
                }
                if n < chunk.len() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("read error on client {id}: {e}");
                closed = true;
                break;
            }
        }
    }
    if closed {
        close_client(net, server, el, fd);
        return;
    }
    process_input(net, server, el, id);
}

/// Run every complete request sitting in the client's query buffer,
/// stopping while the client is blocked.
fn process_input(net: &NetRef, server: &mut Server, el: &mut EventLoop<Server>, id: ClientId) {
    loop {
        let Some(c) = server.client_mut(id) else { return };
        if c.block.is_some() {
            break;
        }
        let mut query = std::mem::take(&mut c.query);
        let parsed = parse_request(&mut query);
        if let Some(c) = server.client_mut(id) {
            c.query = query;
        }
        match parsed {
            ParseResult::Incomplete => break,
            ParseResult::Argv(argv) => {
                server.execute(id, argv);
                apply_actions(net, server, el);
            }
            ParseResult::Error(msg) => {
                warn!("protocol error from client {id}: {msg}");
                if let Some(fd) = net.borrow().fd_of.get(&id).copied() {
                    close_client(net, server, el, fd);
                }
                return;
            }
        }
        let should_close = server.client(id).map(|c| c.should_close).unwrap_or(false);
        if should_close {
            flush_output(net, server, id);
            if let Some(fd) = net.borrow().fd_of.get(&id).copied() {
                close_client(net, server, el, fd);
            }
            return;
        }
    }
    flush_output(net, server, id);
    arm_write_if_pending(net, el, id);
}

/// Move produced replies into the connection buffer and push what the
/// kernel will take.
fn flush_output(net: &NetRef, server: &mut Server, id: ClientId) {
    let out = server.take_output(id);
    let mut n = net.borrow_mut();
    let Some(&fd) = n.fd_of.get(&id) else { return };
    if !out.is_empty() {
        n.pending_out.entry(fd).or_default().extend_from_slice(&out);
    }
    let Some(buf) = n.pending_out.get_mut(&fd) else { return };
    if buf.is_empty() {
        return;
    }
    // Borrow juggling: take the buffer out while writing.
    let mut data = std::mem::take(buf);
    let mut written = 0;
    if let Some(stream) = n.streams.get_mut(&fd) {
        loop {
            match stream.write(&data[written..]) {
                Ok(0) => break,
                Ok(w) => {
                    written += w;
                    if written == data.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
    data.drain(..written);
    *n.pending_out.entry(fd).or_default() = data;
}

fn arm_write_if_pending(net: &NetRef, el: &mut EventLoop<Server>, id: ClientId) {
    let fd = {
        let n = net.borrow();
        let Some(&fd) = n.fd_of.get(&id) else { return };
        if n.pending_out.get(&fd).map_or(true, |b| b.is_empty()) {
            return;
        }
        fd
    };
    if el.file_event_mask(fd) & WRITABLE != 0 {
        return;
    }
    let net = net.clone();
    let _ = el.create_file_event(
        fd,
        WRITABLE,
        Rc::new(move |server, el, fd, _mask| writable(&net, server, el, fd)),
    );
}

fn writable(net: &NetRef, server: &mut Server, el: &mut EventLoop<Server>, fd: RawFd) {
    let id = net.borrow().by_fd.get(&fd).copied();
    let Some(id) = id else {
        el.delete_file_event(fd, WRITABLE);
        return;
    };
    flush_output(net, server, id);
    let drained = net
        .borrow()
        .pending_out
        .get(&fd)
        .map_or(true, |b| b.is_empty());
    if drained {
        el.delete_file_event(fd, WRITABLE);
        // Input may have queued up while we were draining output.
        process_input(net, server, el, id);
    }
}

fn close_client(net: &NetRef, server: &mut Server, el: &mut EventLoop<Server>, fd: RawFd) {
    el.delete_file_event(fd, READABLE | WRITABLE);
    let id = {
        let mut n = net.borrow_mut();
        n.pending_out.remove(&fd);
        n.streams.remove(&fd);
        let id = n.by_fd.remove(&fd);
        if let Some(id) = &id {
            n.fd_of.remove(id);
        }
        id
    };
    if let Some(id) = id {
        server.remove_client(id);
        apply_actions(net, server, el);
    }
}

/// Drain the core's deferred requests against the loop and sockets.
fn apply_actions(net: &NetRef, server: &mut Server, el: &mut EventLoop<Server>) {
    loop {
        let actions = std::mem::take(&mut server.actions);
        if actions.is_empty() {
            return;
        }
        for action in actions {
            match action {
                PostAction::ArmBlockTimer { client, fire_in_ms } => {
                    let net = net.clone();
                    let timer_id = el.create_time_event(
                        fire_in_ms,
                        Rc::new(move |server: &mut Server, el: &mut EventLoop<Server>, _id| {
                            server.on_block_timeout(client);
                            apply_actions(&net, server, el);
                            TimerNext::Stop
                        }),
                        None,
                    );
                    if let Some(c) = server.client_mut(client) {
                        if let Some(b) = c.block.as_mut() {
                            b.timer_id = Some(timer_id);
                        }
                    }
                }
                PostAction::CancelTimer { timer_id } => {
                    el.delete_time_event(timer_id);
                }
                PostAction::Wake { client } => {
                    flush_output(net, server, client);
                    arm_write_if_pending(net, el, client);
                    // A freshly unblocked client may have whole requests
                    // waiting in its query buffer.
                    let has_input = server
                        .client(client)
                        .map(|c| c.block.is_none() && !c.query.is_empty())
                        .unwrap_or(false);
                    if has_input {
                        process_input(net, server, el, client);
                    }
                }
                PostAction::Shutdown => {
                    el.stop();
                }
            }
        }
    }
}
