//! IMAP Store Implementation
//!
//! Blocking IMAP connection used by the sync worker to upload backed-up messages.

use crate::mail::{
    config::{AccountConnectionInfo, SecurityType},
    MailError, MailResult, MailStore,
};
use crate::sync::trust::{evaluate_chain, CertificateChain, CertificateRecord, TrustOutcome};
use imap::{Client, Session};
use native_tls::{HandshakeError, TlsConnector, TlsStream};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

const IO_TIMEOUT: Duration = Duration::from_secs(30);
const STARTTLS_TAG: &str = "a0";

type TlsClient = Client<TlsStream<TcpStream>>;

/// IMAP store over SSL or STARTTLS
#[derive(Default)]
pub struct ImapStore {
    client: Option<TlsClient>,
    session: Option<Session<TlsStream<TcpStream>>>,
}

impl ImapStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&mut self) -> MailResult<&mut Session<TlsStream<TcpStream>>> {
        self.session.as_mut().ok_or(MailError::NotConnected)
    }

    /// TCP connect and, for STARTTLS, negotiate the upgrade in plaintext
    fn open_stream(account: &AccountConnectionInfo) -> MailResult<TcpStream> {
        let address = format!("{}:{}", account.host, account.port);
        let stream = TcpStream::connect(&address).map_err(|e| MailError::Connection(e.to_string()))?;
        stream.set_read_timeout(Some(IO_TIMEOUT)).ok();
        stream.set_write_timeout(Some(IO_TIMEOUT)).ok();

        if account.security == SecurityType::STARTTLS {
            negotiate_starttls(&stream)?;
        }
        Ok(stream)
    }

    fn handshake(
        account: &AccountConnectionInfo,
        connector: &TlsConnector,
    ) -> MailResult<Result<TlsStream<TcpStream>, native_tls::Error>> {
        let stream = Self::open_stream(account)?;
        match connector.connect(&account.host, stream) {
            Ok(tls) => Ok(Ok(tls)),
            Err(HandshakeError::Failure(e)) => Ok(Err(e)),
            Err(HandshakeError::WouldBlock(_)) => {
                Err(MailError::Connection("TLS handshake interrupted".to_string()))
            }
        }
    }

    fn connector(relax_hostname: bool, relax_chain: bool) -> MailResult<TlsConnector> {
        TlsConnector::builder()
            .danger_accept_invalid_hostnames(relax_hostname)
            .danger_accept_invalid_certs(relax_chain)
            .build()
            .map_err(|e| MailError::Connection(e.to_string()))
    }

    fn peer_certificate(tls: &TlsStream<TcpStream>) -> MailResult<CertificateRecord> {
        let der = tls
            .peer_certificate()
            .map_err(|e| MailError::Connection(e.to_string()))?
            .map(|cert| cert.to_der())
            .transpose()
            .map_err(|e| MailError::Connection(e.to_string()))?
            .ok_or_else(|| MailError::Connection("Server presented no certificate".to_string()))?;
        Ok(CertificateRecord::from_der(der))
    }

    /// Retry after the platform rejected the server.
    ///
    /// A chain the platform accepts once hostname checking is off is marked
    /// system-verified, so a wildcard or alternative name that covers the
    /// host still counts. Anything else is only accepted when it matches the
    /// pinned certificate.
    fn handshake_fallback(
        account: &AccountConnectionInfo,
        pinned: Option<&CertificateRecord>,
    ) -> MailResult<TlsStream<TcpStream>> {
        let (tls, system_verified) = match Self::handshake(account, &Self::connector(true, false)?)? {
            Ok(tls) => (tls, true),
            Err(e) => {
                log::debug!("Chain for {} not trusted by platform: {}", account.host, e);
                let tls = Self::handshake(account, &Self::connector(true, true)?)?
                    .map_err(|e| MailError::Connection(e.to_string()))?;
                (tls, false)
            }
        };

        let mut chain = CertificateChain::new(account.host.clone(), account.port, vec![Self::peer_certificate(&tls)?]);
        chain.system_verified = system_verified;

        match evaluate_chain(chain, pinned) {
            TrustOutcome::Trusted => {
                log::info!("Server certificate for {} accepted", account.host);
                Ok(tls)
            }
            TrustOutcome::Untrusted(chain) => Err(MailError::UntrustedCertificate(chain)),
        }
    }
}

impl MailStore for ImapStore {
    fn connect(&mut self, account: &AccountConnectionInfo, pinned: Option<&CertificateRecord>) -> MailResult<()> {
        if account.security == SecurityType::NONE {
            return Err(MailError::Config("Insecure connections not supported".to_string()));
        }

        let tls = match Self::handshake(account, &Self::connector(false, false)?)? {
            Ok(tls) => tls,
            Err(e) => {
                log::warn!("Certificate verification failed for {}: {}", account.host, e);
                Self::handshake_fallback(account, pinned)?
            }
        };

        let mut client = Client::new(tls);
        if account.security == SecurityType::SSL {
            client.read_greeting().map_err(|e| MailError::Imap(e.to_string()))?;
        }

        self.client = Some(client);
        log::info!("Connected to IMAP server: {}:{}", account.host, account.port);
        Ok(())
    }

    fn login(&mut self, account: &AccountConnectionInfo) -> MailResult<()> {
        let client = self.client.take().ok_or(MailError::NotConnected)?;

        let session = client.login(&account.username, &account.password).map_err(|(e, _)| match e {
            imap::error::Error::No(reason) | imap::error::Error::Bad(reason) => MailError::Authentication(reason),
            other => MailError::Imap(other.to_string()),
        })?;

        self.session = Some(session);
        Ok(())
    }

    fn ensure_folder(&mut self, folder: &str) -> MailResult<()> {
        let session = self.session()?;

        let existing = session
            .list(Some(""), Some(folder))
            .map_err(|e| MailError::Imap(e.to_string()))?;
        if existing.iter().any(|name| name.name().eq_ignore_ascii_case(folder)) {
            return Ok(());
        }

        log::info!("Creating backup folder {}", folder);
        session.create(folder).map_err(|e| MailError::Imap(e.to_string()))
    }

    fn append(&mut self, folder: &str, message: &[u8]) -> MailResult<()> {
        self.session()?
            .append(folder, message)
            .map_err(|e| MailError::Imap(e.to_string()))
    }

    fn logout(&mut self) -> MailResult<()> {
        self.client = None;
        if let Some(mut session) = self.session.take() {
            session.logout().map_err(|e| MailError::Imap(e.to_string()))?;
        }
        Ok(())
    }
}

/// Read the greeting and run `STARTTLS` on a plaintext connection
fn negotiate_starttls(stream: &TcpStream) -> MailResult<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    reader.read_line(&mut line)?;
    if !line.starts_with("* OK") && !line.starts_with("* PREAUTH") {
        return Err(MailError::Connection(format!("Unexpected greeting: {}", line.trim_end())));
    }

    let mut writer = stream;
    writer.write_all(format!("{} STARTTLS\r\n", STARTTLS_TAG).as_bytes())?;
    writer.flush()?;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(MailError::Connection("Connection closed during STARTTLS".to_string()));
        }
        if let Some(status) = line.strip_prefix(STARTTLS_TAG).map(str::trim) {
            if status.starts_with("OK") {
                return Ok(());
            }
            return Err(MailError::Connection(format!("STARTTLS refused: {}", status)));
        }
    }
}
