// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serve ioctl requests over a Unix datagram socket.
//!
//! Each datagram carries the raw command number followed by a
//! `lubde_ioctl_t` image, in host byte order. The reply is the same frame,
//! with the outputs and `rc` filled in. Requests are handled one at a time, in
//! the order received.

use crate::ioctl::IoctlHandler;
use crate::regs::RegisterBlock;
use crate::Error;
use nokia_fpga_messages::ioctl::decode_frame;
use nokia_fpga_messages::ioctl::encode_frame;
use nokia_fpga_messages::ioctl::FRAME_SIZE;
use slog::debug;
use slog::error;
use slog::info;
use slog::trace;
use slog::Logger;
use std::path::Path;
use std::sync::Arc;
use tokio::net::unix::SocketAddr;
use tokio::net::UnixDatagram;

/// A server of ioctl requests for one FPGA.
pub struct Server<R, W> {
    log: Logger,
    socket: UnixDatagram,
    handler: Arc<IoctlHandler<R, W>>,
}

impl<R, W> Server<R, W>
where
    R: RegisterBlock + 'static,
    W: RegisterBlock + 'static,
{
    /// Bind a server to a socket path.
    ///
    /// This must be called from within a Tokio runtime.
    pub fn bind(
        log: &Logger,
        path: impl AsRef<Path>,
        handler: Arc<IoctlHandler<R, W>>,
    ) -> Result<Self, Error> {
        let socket = UnixDatagram::bind(path.as_ref())?;
        info!(log, "bound ioctl server"; "path" => %path.as_ref().display());
        Ok(Self::from_socket(log, socket, handler))
    }

    /// Serve requests arriving on an existing socket.
    pub fn from_socket(log: &Logger, socket: UnixDatagram, handler: Arc<IoctlHandler<R, W>>) -> Self {
        Self {
            log: log.new(slog::o!("task" => "server")),
            socket,
            handler,
        }
    }

    // Send a reply to the peer that sent a request.
    async fn reply(&self, peer: &SocketAddr, frame: &[u8]) {
        let res = match peer.as_pathname() {
            Some(path) => self.socket.send_to(frame, path).await,
            // An unnamed peer can only be reached if we are connected to it.
            None => self.socket.send(frame).await,
        };
        match res {
            Ok(n_bytes) => {
                trace!(self.log, "sent reply"; "peer" => ?peer, "n_bytes" => n_bytes);
            }
            Err(e) => {
                error!(
                    self.log,
                    "failed to send reply";
                    "peer" => ?peer,
                    "reason" => ?e,
                );
            }
        }
    }

    /// Serve requests until the socket fails.
    pub async fn run(self) -> Result<(), Error> {
        // Trailing bytes are ignored, so leave room to receive them.
        let mut rx_buf = [0u8; 2 * FRAME_SIZE];
        let mut tx_buf = [0u8; FRAME_SIZE];
        loop {
            let (n_bytes, peer) = match self.socket.recv_from(&mut rx_buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!(self.log, "failed to receive request"; "reason" => ?e);
                    return Err(e.into());
                }
            };
            let (cmd, mut io) = match decode_frame(&rx_buf[..n_bytes]) {
                Ok(x) => x,
                Err(e) => {
                    debug!(
                        self.log,
                        "dropping malformed request";
                        "peer" => ?peer,
                        "n_bytes" => n_bytes,
                        "reason" => %e,
                    );
                    continue;
                }
            };
            trace!(
                self.log,
                "received request";
                "peer" => ?peer,
                "cmd" => ?cmd,
                "dev" => io.dev,
            );

            // The handler polls hardware with blocking sleeps.
            let handler = self.handler.clone();
            io = match tokio::task::spawn_blocking(move || {
                handler.handle(cmd, &mut io);
                io
            })
            .await
            {
                Ok(io) => io,
                Err(e) => {
                    error!(
                        self.log,
                        "request handler failed";
                        "cmd" => ?cmd,
                        "reason" => ?e,
                    );
                    continue;
                }
            };

            encode_frame(cmd, &io, &mut tx_buf);
            self.reply(&peer, &tx_buf).await;
        }
    }
}
