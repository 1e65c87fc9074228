use std::io;
use std::os::fd::AsRawFd;

use mio::{Interest, Token};

use crate::gopher::ErrorReason;
use crate::session::Session;
use reactor::EventLoop;

use super::SharedWorker;

/// Accepts until accept would block (§4.4.2). Over-capacity connections get
/// a `503` menu and an immediate close, never entering the session table.
pub fn on_readable(worker: &SharedWorker, event_loop: &mut EventLoop) {
    loop {
        let accepted = worker.borrow_mut().listener.accept();

        let (mut socket, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!(error = %e, "listener accept failed");
                break;
            }
        };

        let at_capacity = {
            let w = worker.borrow();
            w.client_count >= w.config.maxclients
        };

        if at_capacity {
            reject_over_capacity(&mut socket);
            continue;
        }

        let peer_addr = addr.ip().to_string();
        let token = Token(socket.as_raw_fd() as usize);
        let session = Session::new(socket, peer_addr);

        let mut w = worker.borrow_mut();
        let registered = event_loop.add(
            &mut w.sessions.entry(token).or_insert(session).socket,
            token,
            Interest::READABLE,
            Box::new({
                let cb_worker = worker.clone();
                move |ev_loop, _event| super::request::on_readable(&cb_worker, ev_loop, token)
            }),
        );

        if let Err(e) = registered {
            tracing::warn!(error = %e, "failed to register client socket");
            w.sessions.remove(&token);
            continue;
        }

        w.client_count += 1;
    }
}

fn reject_over_capacity(socket: &mut mio::net::TcpStream) {
    let menu = ErrorReason::ServiceUnavailable.to_string();
    let _ = std::io::Write::write_all(socket, menu.as_bytes());
}
