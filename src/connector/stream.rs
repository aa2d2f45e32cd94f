//! The physical transport: TCP, unix-domain socket, or TLS over TCP.

use std::io;
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_native_tls::{native_tls, TlsStream};

use crate::config::{HostSpec, Options, SslMode};
use crate::errors::{Error, ServerIdentifier};
use crate::messages::frontend;

pin_project! {
    #[project = StreamInnerProj]
    #[derive(Debug)]
    pub enum StreamInner {
        Tcp {
            #[pin]
            stream: TcpStream,
        },
        Tls {
            #[pin]
            stream: Box<TlsStream<TcpStream>>,
        },
        Unix {
            #[pin]
            stream: UnixStream,
        },
    }
}

impl AsyncRead for StreamInner {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::Tls { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::Unix { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamInner {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::Tls { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::Unix { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_flush(cx),
            StreamInnerProj::Tls { stream } => stream.poll_flush(cx),
            StreamInnerProj::Unix { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::Tls { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::Unix { stream } => stream.poll_shutdown(cx),
        }
    }
}

impl StreamInner {
    /// Non-blocking best-effort write, used only for the Terminate byte on
    /// drop. TLS cannot write synchronously; the session dies with the socket.
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamInner::Tcp { stream } => stream.try_write(buf),
            StreamInner::Unix { stream } => stream.try_write(buf),
            StreamInner::Tls { .. } => Ok(0),
        }
    }
}

/// Connect the transport for one host, including the optional TLS upgrade.
pub(crate) async fn connect(
    host: &HostSpec,
    options: &Options,
    identifier: &ServerIdentifier,
) -> Result<StreamInner, Error> {
    if host.is_unix_socket() {
        return connect_unix(host, identifier).await;
    }
    connect_tcp(host, options, identifier).await
}

async fn connect_unix(host: &HostSpec, identifier: &ServerIdentifier) -> Result<StreamInner, Error> {
    let path = host.socket_path();
    let stream = if let Some(abstract_name) = path.strip_prefix('@') {
        connect_abstract(abstract_name, identifier).await?
    } else {
        UnixStream::connect(&path).await.map_err(|err| Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: format!("could not connect to socket {path}: {err}"),
        })?
    };
    Ok(StreamInner::Unix { stream })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
async fn connect_abstract(name: &str, identifier: &ServerIdentifier) -> Result<UnixStream, Error> {
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes()).map_err(
        |err| Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: format!("bad abstract socket name: {err}"),
        },
    )?;
    let connect = move || {
        let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
        stream.set_nonblocking(true)?;
        UnixStream::from_std(stream)
    };
    tokio::task::spawn_blocking(connect)
        .await
        .map_err(|err| Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: format!("connect task failed: {err}"),
        })?
        .map_err(|err| Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: format!("could not connect to abstract socket: {err}"),
        })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
async fn connect_abstract(_name: &str, identifier: &ServerIdentifier) -> Result<UnixStream, Error> {
    Err(Error::ConnectionFailed {
        identifier: identifier.clone(),
        reason: "abstract-namespace sockets are linux-only".into(),
    })
}

async fn connect_tcp(
    host: &HostSpec,
    options: &Options,
    identifier: &ServerIdentifier,
) -> Result<StreamInner, Error> {
    let mut stream = TcpStream::connect((host.host.as_str(), host.port))
        .await
        .map_err(|err| Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: format!("could not connect to {host}: {err}"),
        })?;

    configure_tcp_socket(&stream, options);

    let use_tls = match options.ssl_mode {
        SslMode::Disable | SslMode::Allow => false,
        SslMode::Prefer | SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => true,
    };
    if !use_tls {
        return Ok(StreamInner::Tcp { stream });
    }

    stream
        .write_all(&frontend::ssl_request())
        .await
        .map_err(|err| Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: format!("could not send SSLRequest: {err}"),
        })?;

    let response = stream
        .read_u8()
        .await
        .map_err(|err| Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: format!("no response to SSLRequest: {err}"),
        })?;

    match response {
        b'S' => {
            let connector = tls_connector(options, identifier).await?;
            let stream = connector
                .connect(&host.host, stream)
                .await
                .map_err(|err| Error::ConnectionFailed {
                    identifier: identifier.clone(),
                    reason: format!("TLS handshake failed: {err}"),
                })?;
            Ok(StreamInner::Tls {
                stream: Box::new(stream),
            })
        }
        b'N' => {
            if options.ssl_mode.required() {
                return Err(Error::ConnectionFailed {
                    identifier: identifier.clone(),
                    reason: format!(
                        "server refused TLS but SslMode={} demands it",
                        options.ssl_mode.as_str()
                    ),
                });
            }
            Ok(StreamInner::Tcp { stream })
        }
        other => Err(Error::protocol(format!(
            "unexpected SSLRequest response {:?}",
            other as char
        ))),
    }
}

async fn tls_connector(
    options: &Options,
    identifier: &ServerIdentifier,
) -> Result<tokio_native_tls::TlsConnector, Error> {
    let mut builder = native_tls::TlsConnector::builder();

    if options.trust_server_certificate || !options.ssl_mode.verifies_ca() {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if !options.ssl_mode.verifies_hostname() {
        builder.danger_accept_invalid_hostnames(true);
    }

    if let Some(root) = &options.root_certificate {
        let pem = tokio::fs::read(root).await.map_err(|err| Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: format!("could not read RootCertificate {root}: {err}"),
        })?;
        let cert = native_tls::Certificate::from_pem(&pem).map_err(|err| {
            Error::ConnectionFailed {
                identifier: identifier.clone(),
                reason: format!("bad RootCertificate {root}: {err}"),
            }
        })?;
        builder.add_root_certificate(cert);
    }

    if let (Some(cert), Some(key)) = (&options.ssl_certificate, &options.ssl_key) {
        let cert_pem = tokio::fs::read(cert).await.map_err(|err| Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: format!("could not read SslCertificate {cert}: {err}"),
        })?;
        let key_pem = tokio::fs::read(key).await.map_err(|err| Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: format!("could not read SslKey {key}: {err}"),
        })?;
        let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem).map_err(|err| {
            Error::ConnectionFailed {
                identifier: identifier.clone(),
                reason: format!("bad client certificate: {err}"),
            }
        })?;
        builder.identity(identity);
    }

    let connector = builder.build().map_err(|err| Error::ConnectionFailed {
        identifier: identifier.clone(),
        reason: format!("could not build TLS context: {err}"),
    })?;
    Ok(tokio_native_tls::TlsConnector::from(connector))
}

fn configure_tcp_socket(stream: &TcpStream, options: &Options) {
    let _ = stream.set_nodelay(true);

    let sock = socket2::SockRef::from(stream);
    if options.tcp_keepalive {
        let mut keepalive = socket2::TcpKeepalive::new();
        if options.tcp_keepalive_time > 0 {
            keepalive = keepalive.with_time(Duration::from_secs(options.tcp_keepalive_time));
        }
        if options.tcp_keepalive_interval > 0 {
            keepalive =
                keepalive.with_interval(Duration::from_secs(options.tcp_keepalive_interval));
        }
        if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
            log::warn!("could not enable TCP keepalive: {err}");
        }
    }
    if let Some(size) = options.socket_receive_buffer_size {
        if let Err(err) = sock.set_recv_buffer_size(size) {
            log::warn!("could not set SO_RCVBUF to {size}: {err}");
        }
    }
    if let Some(size) = options.socket_send_buffer_size {
        if let Err(err) = sock.set_send_buffer_size(size) {
            log::warn!("could not set SO_SNDBUF to {size}: {err}");
        }
    }
}
