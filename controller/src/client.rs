// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A client of the ioctl server.

use crate::config::default_retry_interval;
use crate::Error;
use nokia_fpga_messages::ioctl::decode_frame;
use nokia_fpga_messages::ioctl::encode_frame;
use nokia_fpga_messages::ioctl::FRAME_SIZE;
use nokia_fpga_messages::Cmd;
use nokia_fpga_messages::LubdeIoctl;
use nokia_fpga_messages::Width;
use slog::debug;
use slog::Logger;
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixDatagram;

/// Sends ioctl requests to a [`crate::Server`].
#[derive(Debug)]
pub struct Client {
    log: Logger,
    socket: UnixDatagram,
    retry_interval: Duration,
    n_retries: usize,
}

impl Client {
    /// Connect to the server at `server`, receiving replies at `local`.
    ///
    /// This must be called from within a Tokio runtime.
    pub fn connect(
        log: &Logger,
        server: impl AsRef<Path>,
        local: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        let socket = UnixDatagram::bind(local)?;
        socket.connect(server)?;
        Ok(Self::from_socket(log, socket))
    }

    /// Use a socket already connected to a server.
    pub fn from_socket(log: &Logger, socket: UnixDatagram) -> Self {
        Self {
            log: log.new(slog::o!("task" => "client")),
            socket,
            retry_interval: default_retry_interval(),
            n_retries: usize::MAX,
        }
    }

    /// Set how long to wait for a reply before resending a request.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the number of times a request is sent before giving up.
    pub fn n_retries(mut self, retries: usize) -> Self {
        self.n_retries = retries.max(1);
        self
    }

    /// Send a request, returning the reply.
    ///
    /// A reply reporting failure in `rc` is still returned; see
    /// [`Client::call_checked`].
    pub async fn call(&self, cmd: Cmd, io: &LubdeIoctl) -> Result<LubdeIoctl, Error> {
        let mut tx_buf = [0u8; FRAME_SIZE];
        let mut rx_buf = [0u8; 2 * FRAME_SIZE];
        encode_frame(cmd, io, &mut tx_buf);

        let mut attempts = 0;
        while attempts < self.n_retries {
            self.socket.send(&tx_buf).await?;
            attempts += 1;
            let deadline = tokio::time::sleep(self.retry_interval);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    res = self.socket.recv(&mut rx_buf) => {
                        let n_bytes = res?;
                        match decode_frame(&rx_buf[..n_bytes]) {
                            Ok((reply_cmd, reply)) if reply_cmd == cmd => return Ok(reply),
                            Ok((reply_cmd, _)) => {
                                // A late reply to an earlier request.
                                debug!(
                                    self.log,
                                    "discarding unexpected reply";
                                    "expected" => ?cmd,
                                    "received" => ?reply_cmd,
                                );
                            }
                            Err(e) => {
                                debug!(
                                    self.log,
                                    "dropping malformed reply";
                                    "reason" => %e,
                                    "len" => n_bytes,
                                );
                            }
                        }
                    }
                    _ = &mut deadline => {
                        debug!(
                            self.log,
                            "request timed out";
                            "cmd" => ?cmd,
                            "attempt" => attempts,
                        );
                        break;
                    }
                }
            }
        }
        Err(Error::MaxRetries(attempts))
    }

    /// Send a request, failing if the reply reports failure.
    pub async fn call_checked(&self, cmd: Cmd, io: &LubdeIoctl) -> Result<LubdeIoctl, Error> {
        let reply = self.call(cmd, io).await?;
        if reply.succeeded() {
            Ok(reply)
        } else {
            Err(Error::RequestFailed(reply.rc))
        }
    }

    /// Return the server's interface version.
    pub async fn version(&self) -> Result<u32, Error> {
        Ok(self.call_checked(Cmd::Version, &LubdeIoctl::default()).await?.d0)
    }

    /// Reset the BDB, returning the bitmap of present slots.
    pub async fn bdb_init(&self) -> Result<u32, Error> {
        Ok(self
            .call_checked(Cmd::NokiaBdbInit, &LubdeIoctl::default())
            .await?
            .d0)
    }

    pub async fn bdb_read(&self, slot: u8, address: u32, width: Width) -> Result<u64, Error> {
        let mut io = LubdeIoctl::default();
        io.d0 = u32::from(slot);
        io.d1 = width.bytes() as u32;
        io.p0 = u64::from(address);
        let reply = self.call_checked(Cmd::NokiaBdbReadWord, &io).await?;
        Ok(reply.value64() & width.mask())
    }

    pub async fn bdb_write_word(
        &self,
        slot: u8,
        address: u32,
        width: Width,
        value: u64,
    ) -> Result<(), Error> {
        let mut io = LubdeIoctl::default();
        io.d0 = u32::from(slot);
        io.d1 = width.bytes() as u32;
        io.p0 = u64::from(address);
        io.set_value64(value & width.mask());
        self.call_checked(Cmd::NokiaBdbWriteWord, &io).await?;
        Ok(())
    }

    pub async fn iproc_read(&self, slot: u8, address: u32) -> Result<u32, Error> {
        let mut io = LubdeIoctl::default();
        io.d0 = u32::from(slot);
        io.p0 = u64::from(address);
        Ok(self.call_checked(Cmd::NokiaIprocRead, &io).await?.d1)
    }

    pub async fn iproc_write(&self, slot: u8, address: u32, value: u32) -> Result<(), Error> {
        let mut io = LubdeIoctl::default();
        io.d0 = u32::from(slot);
        io.p0 = u64::from(address);
        io.d1 = value;
        self.call_checked(Cmd::NokiaIprocWrite, &io).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Client;
    use crate::ioctl::IoctlHandler;
    use crate::test_utils::test_bdb;
    use crate::test_utils::test_logger;
    use crate::Error;
    use crate::Server;
    use nokia_fpga_messages::ioctl::decode_frame;
    use nokia_fpga_messages::ioctl::encode_frame;
    use nokia_fpga_messages::ioctl::FRAME_SIZE;
    use nokia_fpga_messages::ioctl::INTERFACE_VERSION;
    use nokia_fpga_messages::ioctl::LUBDE_FAIL;
    use nokia_fpga_messages::Cmd;
    use nokia_fpga_messages::LubdeIoctl;
    use nokia_fpga_messages::Width;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::UnixDatagram;

    #[tokio::test]
    async fn test_client_round_trips_through_server() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(1 << 5);
        let handler = Arc::new(IoctlHandler::new(&test_logger(), Arc::new(bdb)));
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let task = tokio::spawn(Server::from_socket(&test_logger(), theirs, handler).run());
        let client = Client::from_socket(&test_logger(), ours);

        assert_eq!(client.version().await.unwrap(), INTERFACE_VERSION);
        assert_eq!(client.bdb_init().await.unwrap(), 1 << 5);

        client
            .bdb_write_word(5, 0x0800_1000, Width::Eight, 0x0102_0304_0506_0708)
            .await
            .unwrap();
        assert_eq!(
            sim.peek_remote(5, 0x0800_1000, 8),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(
            client.bdb_read(5, 0x0800_1004, Width::Four).await.unwrap(),
            0x0506_0708
        );

        client.iproc_write(5, 0x1023_1008, 0xfeed).await.unwrap();
        assert_eq!(client.iproc_read(5, 0x1023_1008).await.unwrap(), 0xfeed);

        // The slot is absent, so the server reports failure.
        let mut io = LubdeIoctl::default();
        io.d0 = 6;
        io.d1 = 4;
        let reply = client.call(Cmd::NokiaBdbReadWord, &io).await.unwrap();
        assert_eq!(reply.rc, LUBDE_FAIL);
        assert!(matches!(
            client.bdb_read(6, 0, Width::Four).await,
            Err(Error::RequestFailed(LUBDE_FAIL))
        ));

        task.abort();
    }

    #[tokio::test]
    async fn test_client_gives_up_after_retries() {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let client = Client::from_socket(&test_logger(), ours)
            .retry_interval(Duration::from_millis(10))
            .n_retries(3);
        assert!(matches!(client.version().await, Err(Error::MaxRetries(3))));

        // Every attempt reached the peer.
        let mut buf = [0; 256];
        for _ in 0..3 {
            theirs.try_recv(&mut buf).unwrap();
        }
        assert!(theirs.try_recv(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_client_skips_malformed_replies() {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let peer = tokio::spawn(async move {
            let mut buf = [0; 2 * FRAME_SIZE];
            let n = theirs.recv(&mut buf).await.unwrap();
            let (cmd, mut reply) = decode_frame(&buf[..n]).unwrap();

            // A runt, then a frame with an unknown command, then the reply.
            theirs.send(&[0xde, 0xad]).await.unwrap();
            let mut junk = [0; FRAME_SIZE];
            encode_frame(cmd, &reply, &mut junk);
            junk[..4].copy_from_slice(&0xffff_ffffu32.to_ne_bytes());
            theirs.send(&junk).await.unwrap();

            reply.d0 = INTERFACE_VERSION;
            let mut frame = [0; FRAME_SIZE];
            encode_frame(cmd, &reply, &mut frame);
            theirs.send(&frame).await.unwrap();
        });

        let client = Client::from_socket(&test_logger(), ours)
            .retry_interval(Duration::from_secs(5))
            .n_retries(1);
        assert_eq!(client.version().await.unwrap(), INTERFACE_VERSION);
        peer.await.unwrap();
    }
}
