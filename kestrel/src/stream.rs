// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConnection, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerName};

use crate::error::{Error, ErrorKind};

/// Certificate material supplied at client creation, all DER encoded.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    /// Broker certificate to validate against.
    ///
    /// - `None`: validate against the system web roots.
    /// - `Some(der)`: the server's certificate must match these bytes.
    /// - `Some(empty)`: accept any certificate. Not recommended.
    broker_cert: Option<Vec<u8>>,

    /// Client certificate presented on connection, required for mutual TLS.
    client_cert: Option<Vec<u8>>,

    /// Private key matching `client_cert`.
    client_key: Option<Vec<u8>>,
}

impl TlsOptions {
    /// Create options which validate the broker against the web roots.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            broker_cert: None,
            client_cert: None,
            client_key: None,
        }
    }

    /// Pin the broker certificate to `der`. An empty slice disables
    /// certificate validation entirely.
    pub fn set_broker_cert(&mut self, der: &[u8]) -> &mut Self {
        self.broker_cert = Some(der.to_vec());
        self
    }

    /// Provide a client certificate and private key for mutual TLS.
    pub fn set_client_cert(&mut self, cert_der: &[u8], key_der: &[u8]) -> &mut Self {
        self.client_cert = Some(cert_der.to_vec());
        self.client_key = Some(key_der.to_vec());
        self
    }
}

/// Accepts only a certificate which is byte-identical to the pinned DER
/// blob.
struct PinnedCertVerifier {
    der: Vec<u8>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.0 == self.der {
            Ok(ServerCertVerified::assertion())
        } else {
            log::error!("stream: Server certificate does not match pinned certificate");
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }
}

/// Accepts any certificate without validation.
struct AcceptAnyCertVerifier;

impl ServerCertVerifier for AcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn tls_config(tls: &TlsOptions) -> Result<rustls::ClientConfig, Error> {
    let builder = rustls::ClientConfig::builder().with_safe_defaults();

    let config = match &tls.broker_cert {
        None => {
            let mut root_store = RootCertStore::empty();
            root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
            let builder = builder.with_root_certificates(root_store);
            match (&tls.client_cert, &tls.client_key) {
                (Some(cert), Some(key)) => builder.with_client_auth_cert(
                    vec![Certificate(cert.clone())],
                    PrivateKey(key.clone()),
                )?,
                _ => builder.with_no_client_auth(),
            }
        }
        Some(der) if der.is_empty() => {
            let builder = builder.with_custom_certificate_verifier(Arc::new(AcceptAnyCertVerifier));
            match (&tls.client_cert, &tls.client_key) {
                (Some(cert), Some(key)) => builder.with_client_auth_cert(
                    vec![Certificate(cert.clone())],
                    PrivateKey(key.clone()),
                )?,
                _ => builder.with_no_client_auth(),
            }
        }
        Some(der) => {
            let builder = builder.with_custom_certificate_verifier(Arc::new(PinnedCertVerifier {
                der: der.clone(),
            }));
            match (&tls.client_cert, &tls.client_key) {
                (Some(cert), Some(key)) => builder.with_client_auth_cert(
                    vec![Certificate(cert.clone())],
                    PrivateKey(key.clone()),
                )?,
                _ => builder.with_no_client_auth(),
            }
        }
    };
    Ok(config)
}

/// A reliable, ordered byte stream to the broker, optionally wrapped
/// in TLS.
///
/// The reader half and the writer half progress independently: the
/// underlying socket is duplicated so that a blocked reader never holds a
/// lock a writer needs.
pub enum Stream {
    Mqtt(TcpInner),
    Mqtts(TlsInner),
}

pub struct TcpInner {
    reader: TcpStream,
    writer: Mutex<TcpStream>,
}

pub struct TlsInner {
    reader: TcpStream,
    writer: Mutex<TcpStream>,
    conn: Mutex<ClientConnection>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mqtt(..) => f.write_str("Mqtt"),
            Self::Mqtts(..) => f.write_str("Mqtts"),
        }
    }
}

impl Stream {
    /// Open a connection to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns error if the TCP connection or the TLS handshake fails.
    pub fn connect(
        host: &str,
        port: u16,
        use_tls: bool,
        tls: &TlsOptions,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let addr = resolve(host, port)?;
        let sock = TcpStream::connect_timeout(&addr, timeout)?;
        sock.set_nodelay(true)?;

        if !use_tls {
            let writer = Mutex::new(sock.try_clone()?);
            return Ok(Self::Mqtt(TcpInner {
                reader: sock,
                writer,
            }));
        }

        let config = tls_config(tls)?;
        let server_name = ServerName::try_from(host)
            .map_err(|_e| Error::new(ErrorKind::BadParameter, "Invalid server name"))?;
        let mut conn = ClientConnection::new(Arc::new(config), server_name)?;

        // Drive the handshake to completion before handing the connection
        // out; afterwards reads and writes are independent.
        sock.set_read_timeout(Some(timeout))?;
        sock.set_write_timeout(Some(timeout))?;
        let mut handshake_sock = sock.try_clone()?;
        while conn.is_handshaking() {
            conn.complete_io(&mut handshake_sock)
                .map_err(|err| Error::from_string(ErrorKind::NetworkError, format!("Tls handshake failed: {}", err)))?;
        }

        let writer = Mutex::new(sock.try_clone()?);
        Ok(Self::Mqtts(TlsInner {
            reader: sock,
            writer,
            conn: Mutex::new(conn),
        }))
    }

    /// Write a whole buffer to the stream.
    ///
    /// Packet bytes never interleave: the caller serializes `send` calls
    /// with its own write lock, this method only guards the TLS session
    /// state.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails or times out.
    pub fn send(&self, buf: &[u8], timeout: Duration) -> Result<usize, Error> {
        match self {
            Self::Mqtt(inner) => {
                let mut writer = lock_poisoned(inner.writer.lock())?;
                writer.set_write_timeout(Some(timeout))?;
                writer.write_all(buf)?;
                Ok(buf.len())
            }
            Self::Mqtts(inner) => {
                let mut conn = lock_poisoned(inner.conn.lock())?;
                conn.writer().write_all(buf)?;
                let mut writer = lock_poisoned(inner.writer.lock())?;
                writer.set_write_timeout(Some(timeout))?;
                while conn.wants_write() {
                    conn.write_tls(&mut *writer)?;
                }
                Ok(buf.len())
            }
        }
    }

    /// Read available bytes into `buf`, blocking up to `timeout`.
    ///
    /// Only the event-loop thread calls this. Returns `Ok(0)` when the peer
    /// closed the connection.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` if no bytes arrived in time, `NetworkError` on
    /// any transport failure.
    pub fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        match self {
            Self::Mqtt(inner) => {
                inner.reader.set_read_timeout(Some(timeout))?;
                let n = (&inner.reader).read(buf)?;
                Ok(n)
            }
            Self::Mqtts(inner) => {
                loop {
                    // Drain plaintext buffered in the TLS session first.
                    {
                        let mut conn = lock_poisoned(inner.conn.lock())?;
                        match conn.reader().read(buf) {
                            Ok(n) => return Ok(n),
                            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                            Err(err) => return Err(err.into()),
                        }
                    }

                    inner.reader.set_read_timeout(Some(timeout))?;
                    let mut raw = [0u8; 4096];
                    let n = (&inner.reader).read(&mut raw)?;
                    if n == 0 {
                        return Ok(0);
                    }

                    let mut conn = lock_poisoned(inner.conn.lock())?;
                    let mut cursor = &raw[..n];
                    while !cursor.is_empty() {
                        let consumed = conn.read_tls(&mut cursor)?;
                        conn.process_new_packets().map_err(Error::from)?;
                        if consumed == 0 {
                            return Err(Error::new(ErrorKind::NetworkError, "Tls buffer stalled"));
                        }
                    }
                    // Session-level output triggered by the read, e.g. a
                    // key update response.
                    if conn.wants_write() {
                        let mut writer = lock_poisoned(inner.writer.lock())?;
                        while conn.wants_write() {
                            conn.write_tls(&mut *writer)?;
                        }
                    }
                }
            }
        }
    }

    /// Shut down the connection. Safe to call from any thread; a reader
    /// blocked in `recv` wakes up with an error.
    pub fn close(&self) {
        match self {
            Self::Mqtt(inner) => {
                let _ret = inner.reader.shutdown(Shutdown::Both);
            }
            Self::Mqtts(inner) => {
                if let Ok(mut conn) = inner.conn.lock() {
                    conn.send_close_notify();
                    if let Ok(mut writer) = inner.writer.lock() {
                        while conn.wants_write() {
                            if conn.write_tls(&mut *writer).is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ret = inner.reader.shutdown(Shutdown::Both);
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .next()
        .ok_or_else(|| Error::new(ErrorKind::BadParameter, "Failed to resolve host"))
}

fn lock_poisoned<'a, T>(
    result: Result<std::sync::MutexGuard<'a, T>, std::sync::PoisonError<std::sync::MutexGuard<'a, T>>>,
) -> Result<std::sync::MutexGuard<'a, T>, Error> {
    result.map_err(|_e| Error::new(ErrorKind::NetworkError, "Stream lock poisoned"))
}
