//! A scripted repeater speaking the HomeBrew protocol over a real UDP socket.
//!
//! Protocol-step helpers panic with a descriptive message when the master
//! replies with something unexpected, so test failures point at the exact
//! step that broke.

use hb_protocol::{
    auth_digest, build_rptc, build_rptcl, build_rptk, build_rptl, build_rpto, build_rptping,
    classify, parse_frame, Command, Dmrd, RepeaterId, RptcPayload,
};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MockRepeater {
    sock: UdpSocket,
    server: SocketAddr,
    pub id: RepeaterId,
}

impl MockRepeater {
    /// Bind a fresh local socket pointed at `server`.
    pub async fn bind(server: SocketAddr, id: u32) -> std::io::Result<Self> {
        let sock = UdpSocket::bind("127.0.0.1:0").await?;
        Ok(MockRepeater {
            sock,
            server,
            id: RepeaterId(id),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr().expect("local_addr always succeeds after bind")
    }

    pub async fn send(&self, buf: &[u8]) {
        self.sock
            .send_to(buf, self.server)
            .await
            .expect("UDP send to master");
    }

    /// Receive one datagram from the master (2 s timeout).
    pub async fn recv(&self) -> Vec<u8> {
        let mut buf = [0u8; 1500];
        let (len, _addr) = timeout(RECV_TIMEOUT, self.sock.recv_from(&mut buf))
            .await
            .expect("timed out waiting for master reply")
            .expect("UDP recv from master");
        buf[..len].to_vec()
    }

    /// Try to receive; `None` when nothing arrives within `wait`.
    pub async fn try_recv(&self, wait: Duration) -> Option<Vec<u8>> {
        let mut buf = [0u8; 1500];
        match timeout(wait, self.sock.recv_from(&mut buf)).await {
            Ok(Ok((len, _addr))) => Some(buf[..len].to_vec()),
            _ => None,
        }
    }

    /// Send `RPTL` and return the 4-byte salt from the `MSTCL` challenge.
    pub async fn login(&self) -> [u8; 4] {
        self.send(&build_rptl(self.id)).await;
        let reply = self.recv().await;
        let frame = parse_frame(&reply).expect("parsable login reply");
        assert_eq!(
            frame.command,
            Command::Mstcl,
            "expected MSTCL challenge, got {}",
            frame.command
        );
        assert_eq!(frame.repeater_id, self.id);
        frame.payload.try_into().expect("4-byte salt")
    }

    /// Expect the master to refuse the login with `MSTNAK`.
    pub async fn login_expect_nak(&self) {
        self.send(&build_rptl(self.id)).await;
        let reply = self.recv().await;
        assert_eq!(
            classify(&reply),
            Some(Command::Mstnak),
            "expected MSTNAK for refused login"
        );
    }

    /// Answer the salt challenge; panics unless the master ACKs.
    pub async fn authenticate(&self, salt: [u8; 4], passphrase: &str) {
        let digest = auth_digest(salt, passphrase);
        self.send(&build_rptk(self.id, &digest)).await;
        let reply = self.recv().await;
        assert_eq!(
            classify(&reply),
            Some(Command::Rptack),
            "expected RPTACK after RPTK"
        );
    }

    /// Answer the challenge with a wrong passphrase and expect `MSTNAK`.
    pub async fn authenticate_expect_nak(&self, salt: [u8; 4], passphrase: &str) {
        let digest = auth_digest(salt, passphrase);
        self.send(&build_rptk(self.id, &digest)).await;
        let reply = self.recv().await;
        assert_eq!(
            classify(&reply),
            Some(Command::Mstnak),
            "expected MSTNAK for bad digest"
        );
    }

    /// Send the 302-byte configuration block; panics unless ACK'd.
    pub async fn send_config(&self, callsign: &str) {
        let meta = RptcPayload {
            callsign: callsign.to_owned(),
            rx_freq: "449000000".to_owned(),
            tx_freq: "444000000".to_owned(),
            tx_power: "25".to_owned(),
            color_code: "01".to_owned(),
            latitude: "43.64510".to_owned(),
            longitude: "-79.38020".to_owned(),
            height: "75".to_owned(),
            location: "Test bench".to_owned(),
            description: "mock repeater".to_owned(),
            slots: "2".to_owned(),
            url: String::new(),
            software_id: "hb-test-utils".to_owned(),
            package_id: "hb-test-utils".to_owned(),
        };
        self.send(&build_rptc(self.id, &meta)).await;
        let reply = self.recv().await;
        assert_eq!(
            classify(&reply),
            Some(Command::Rptack),
            "expected RPTACK after RPTC"
        );
    }

    /// Full handshake: login, authenticate, configure.
    pub async fn connect(&self, passphrase: &str, callsign: &str) {
        let salt = self.login().await;
        self.authenticate(salt, passphrase).await;
        self.send_config(callsign).await;
    }

    /// Send an `RPTO` options string; panics unless ACK'd.
    pub async fn send_options(&self, options: &str) {
        self.send(&build_rpto(self.id, options)).await;
        let reply = self.recv().await;
        assert_eq!(
            classify(&reply),
            Some(Command::Rptack),
            "expected RPTACK after RPTO"
        );
    }

    /// Send a keepalive; panics unless the master pongs.
    pub async fn ping(&self) {
        self.send(&build_rptping(self.id)).await;
        let reply = self.recv().await;
        assert_eq!(
            classify(&reply),
            Some(Command::Mstpong),
            "expected MSTPONG"
        );
    }

    pub async fn close(&self) {
        self.send(&build_rptcl(self.id)).await;
    }

    pub async fn send_dmrd(&self, frame: &[u8]) {
        self.send(frame).await;
    }

    /// Receive a forwarded `DMRD`, skipping unrelated traffic.
    pub async fn recv_dmrd(&self) -> Dmrd {
        loop {
            let buf = self.recv().await;
            if classify(&buf) == Some(Command::Dmrd) {
                return Dmrd::parse(&buf).expect("well-formed forwarded DMRD");
            }
        }
    }
}
