use std::{ net::SocketAddr, sync::Arc, task::{ Context, Poll }, time::Duration };

use anyhow::{ anyhow, Result };
use chrono::Utc;
use mail_parser::{ Message, MessageParser, MimeHeaders };
use tokio::{
    io::{ AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadBuf },
    net::{ TcpListener, TcpStream },
    sync::watch,
    time::timeout,
};
use tokio_rustls::{
    rustls::{ self, pki_types::{ CertificateDer, PrivateKeyDer } },
    TlsAcceptor,
};
use tracing::{ error, info, warn };

use crate::{ identity, runtime::Runtime, storage::{ Email, EmailStore } };

/// Inbound-only public SMTP receiver.
///
/// Implements the core RFC 5321 flow (EHLO/HELO, MAIL, RCPT, DATA, RSET,
/// NOOP, VRFY, QUIT) plus STARTTLS when a certificate is configured. There
/// is no AUTH: anyone may deliver, but only to addresses whose owner has
/// registered them through the HTTP plane. Recipient gating is the
/// `active_address:<addr>` marker in the shared store.
pub async fn run_smtp_server(
    runtime: Arc<Runtime>,
    mut shutdown: watch::Receiver<bool>
) -> Result<()> {
    let cfg = &runtime.config;
    let hostname = cfg.domain.clone();

    let tls_acceptor = match (&cfg.smtp_cert_path, &cfg.smtp_key_path) {
        (Some(cert), Some(key)) => match create_tls_acceptor(cert, key) {
            Ok(acceptor) => {
                info!("TLS certificates loaded, STARTTLS enabled");
                Some(acceptor)
            }
            Err(e) => {
                warn!("TLS certificate failed to load (STARTTLS disabled): {}", e);
                None
            }
        },
        _ => {
            info!("TLS certificates not configured, running without STARTTLS");
            None
        }
    };

    let addr = cfg.smtp_listen_addr();
    let listener = TcpListener::bind(&addr).await
        .map_err(|e| anyhow!("SMTP bind {} failed: {}", addr, e))?;
    info!("SMTP listening on {}", addr);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("SMTP listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let runtime = runtime.clone();
                        let hostname = hostname.clone();
                        let tls_acceptor = tls_acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, runtime, hostname, tls_acceptor).await {
                                warn!("SMTP session from {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("SMTP accept failed: {}", e);
                    }
                }
            }
        }
    }
}

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const SAVE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const MAX_RECIPIENTS: usize = 50;

/// One mail transaction plus the surrounding connection state.
pub(crate) struct SmtpSession {
    store: Arc<dyn EmailStore>,
    helo_name: Option<String>,
    mail_from: Option<String>,
    recipients: Vec<String>,
}

impl SmtpSession {
    pub(crate) fn new(store: Arc<dyn EmailStore>) -> Self {
        Self {
            store,
            helo_name: None,
            mail_from: None,
            recipients: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.mail_from = None;
        self.recipients.clear();
    }

    fn handle_mail_from(&mut self, line: &str) -> String {
        if self.helo_name.is_none() {
            return "503 5.5.1 Send EHLO/HELO first".to_string();
        }

        let (sender, declared_size) = match parse_mail_from(line) {
            Ok(parsed) => parsed,
            Err(_) => {
                return "501 5.1.7 Invalid sender syntax".to_string();
            }
        };

        if declared_size.is_some_and(|sz| sz > MAX_MESSAGE_SIZE) {
            return "552 5.3.4 Message size exceeds fixed maximum".to_string();
        }

        self.reset();
        self.mail_from = Some(sender);
        "250 2.1.0 Sender OK".to_string()
    }

    async fn handle_rcpt(&mut self, line: &str) -> String {
        if self.mail_from.is_none() {
            return "503 5.5.1 Need MAIL command".to_string();
        }
        if self.recipients.len() >= MAX_RECIPIENTS {
            return "452 4.5.3 Too many recipients".to_string();
        }

        let rcpt = extract_email_address(&line[8..]);
        let local_part = extract_local_part(&rcpt).to_lowercase();

        if !identity::is_valid_address(&local_part) {
            return "550 5.1.1 Invalid address format".to_string();
        }

        match self.store.is_address_active(&local_part).await {
            Ok(true) => {
                self.recipients.push(local_part);
                "250 2.1.5 Recipient OK".to_string()
            }
            Ok(false) => {
                "550 5.1.1 Mailbox does not exist or is currently inactive".to_string()
            }
            Err(e) => {
                error!("Recipient lookup failed: {}", e);
                "451 4.3.0 Temporary lookup failure".to_string()
            }
        }
    }

    fn check_data_allowed(&self) -> Option<String> {
        if self.mail_from.is_none() {
            return Some("503 5.5.1 Need MAIL command".to_string());
        }
        if self.recipients.is_empty() {
            return Some("503 5.5.1 Need RCPT command".to_string());
        }
        None
    }

    /// Parse the collected message and deliver one copy per recipient.
    /// Already-saved recipients are not rolled back on later failure.
    async fn finish_data(&mut self, raw: &[u8]) -> String {
        let from = self.mail_from.clone().unwrap_or_default();
        let recipients = std::mem::take(&mut self.recipients);
        self.mail_from = None;

        let Some(message) = MessageParser::default().parse(raw) else {
            warn!("SMTP delivery failed: unparsable message");
            return "451 4.3.0 Temporary failure".to_string();
        };

        let email = build_email(&message, from, recipients.clone());

        let mut last_err: Option<anyhow::Error> = None;
        for recipient in &recipients {
            match timeout(SAVE_TIMEOUT, self.store.save_email(recipient, email.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Error saving email for {}: {}", recipient, e);
                    last_err = Some(e);
                }
                Err(_) => {
                    error!("Timed out saving email for {}", recipient);
                    last_err = Some(anyhow!("save timed out"));
                }
            }
        }

        match last_err {
            None => {
                info!("Email saved to {} recipient(s)", recipients.len());
                "250 2.0.0 OK".to_string()
            }
            Some(e) => {
                warn!("SMTP delivery failed: {}", e);
                "451 4.3.0 Temporary failure".to_string()
            }
        }
    }
}

/// Build the stored record from a parsed message. The body keeps the first
/// inline text/html part when present, otherwise the first text/plain one.
/// Attachments are never stored.
fn build_email(message: &Message, from: String, to: Vec<String>) -> Email {
    for attachment in message.attachments() {
        info!(
            "Skipping attachment: {} (not supported)",
            attachment.attachment_name().unwrap_or("unnamed")
        );
    }

    let body = message
        .html_bodies()
        .next()
        .and_then(|part| part.text_contents())
        .or_else(|| message.text_bodies().next().and_then(|part| part.text_contents()))
        .unwrap_or_default()
        .to_string();

    Email {
        id: String::new(),
        from,
        to,
        subject: message.subject().unwrap_or_default().to_string(),
        body,
        received_at: Utc::now(),
    }
}

fn parse_mail_from(line: &str) -> Result<(String, Option<usize>)> {
    // MAIL FROM:<addr> [SIZE=n]
    let after = line.get(10..).ok_or_else(|| anyhow!("MAIL FROM missing"))?.trim();

    let mut parts = after.split_whitespace();
    let sender = extract_email_address(parts.next().unwrap_or(""));

    let mut declared_size = None;
    for p in parts {
        if let Some(sz) = p.to_ascii_uppercase().strip_prefix("SIZE=") {
            if let Ok(n) = sz.parse::<usize>() {
                declared_size = Some(n);
            }
        }
    }

    Ok((sender, declared_size))
}

fn extract_email_address(param: &str) -> String {
    let param = param.trim();
    if param.starts_with('<') && param.ends_with('>') && param.len() >= 2 {
        param[1..param.len() - 1].trim().to_string()
    } else {
        param.to_string()
    }
}

fn extract_local_part(email: &str) -> &str {
    match email.rfind('@') {
        Some(idx) => &email[..idx],
        None => email,
    }
}

enum AnyStream {
    Plain(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

impl Unpin for AnyStream {}

impl AsyncRead for AnyStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8]
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, data),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    runtime: Arc<Runtime>,
    hostname: String,
    tls_acceptor: Option<TlsAcceptor>
) -> Result<()> {
    let mut session = SmtpSession::new(runtime.store.clone());
    let mut tls_active = false;
    let mut data_mode = false;
    let mut data_buf: Vec<u8> = Vec::new();

    let stream = AnyStream::Plain(stream);
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    info!(%peer, "SMTP connection");
    write_line(&mut writer, &format!("220 {} ESMTP coresend", hostname)).await?;

    let mut line = String::new();
    loop {
        line.clear();
        let n = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(read) => read?,
            Err(_) => {
                warn!(%peer, "SMTP read timeout");
                break;
            }
        };
        if n == 0 {
            break;
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);

        if data_mode {
            if trimmed == "." {
                data_mode = false;
                let reply = session.finish_data(&data_buf).await;
                data_buf.clear();
                write_line(&mut writer, &reply).await?;
                continue;
            }

            // Dot unstuffing
            let processed = trimmed.strip_prefix("..").map_or(trimmed, |rest| rest);

            if data_buf.len() + processed.len() + 2 > MAX_MESSAGE_SIZE {
                data_mode = false;
                data_buf.clear();
                session.reset();
                write_line(&mut writer, "552 5.3.4 Message size exceeds fixed maximum").await?;
                continue;
            }
            data_buf.extend_from_slice(processed.as_bytes());
            data_buf.extend_from_slice(b"\r\n");
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }

        let upper = trimmed.to_ascii_uppercase();

        if upper.starts_with("EHLO ") || upper == "EHLO" {
            session.helo_name = Some(trimmed.get(5..).unwrap_or("").trim().to_string());
            write_line(&mut writer, &format!("250-{}", hostname)).await?;
            write_line(&mut writer, "250-PIPELINING").await?;
            write_line(&mut writer, &format!("250-SIZE {}", MAX_MESSAGE_SIZE)).await?;
            if tls_acceptor.is_some() && !tls_active {
                write_line(&mut writer, "250-STARTTLS").await?;
            }
            write_line(&mut writer, "250 OK").await?;
            continue;
        }

        if upper.starts_with("HELO ") || upper == "HELO" {
            session.helo_name = Some(trimmed.get(5..).unwrap_or("").trim().to_string());
            write_line(&mut writer, &format!("250 {}", hostname)).await?;
            continue;
        }

        if upper == "NOOP" {
            write_line(&mut writer, "250 2.0.0 OK").await?;
            continue;
        }

        if upper == "RSET" {
            session.reset();
            data_buf.clear();
            data_mode = false;
            write_line(&mut writer, "250 2.0.0 OK").await?;
            continue;
        }

        if upper == "QUIT" {
            write_line(&mut writer, "221 2.0.0 Bye").await?;
            break;
        }

        if upper.starts_with("VRFY") {
            write_line(&mut writer, "252 2.1.5 Cannot VRFY user").await?;
            continue;
        }

        if upper == "STARTTLS" {
            let Some(acceptor) = tls_acceptor.clone() else {
                write_line(&mut writer, "454 4.7.0 TLS not available").await?;
                continue;
            };
            if tls_active {
                write_line(&mut writer, "454 4.7.0 TLS not available").await?;
                continue;
            }

            write_line(&mut writer, "220 2.0.0 Ready to start TLS").await?;

            let stream = reader.into_inner().unsplit(writer.into_inner());
            let tcp = match stream {
                AnyStream::Plain(tcp) => tcp,
                AnyStream::Tls(_) => return Err(anyhow!("unexpected TLS stream before STARTTLS")),
            };

            let tls_stream = acceptor.accept(tcp).await?;
            tls_active = true;
            session = SmtpSession::new(runtime.store.clone());

            let (r, w) = tokio::io::split(AnyStream::Tls(tls_stream));
            reader = BufReader::new(r);
            writer = BufWriter::new(w);
            continue;
        }

        if upper.starts_with("MAIL FROM:") {
            let reply = session.handle_mail_from(trimmed);
            write_line(&mut writer, &reply).await?;
            continue;
        }

        if upper.starts_with("RCPT TO:") {
            let reply = session.handle_rcpt(trimmed).await;
            write_line(&mut writer, &reply).await?;
            continue;
        }

        if upper == "DATA" {
            if let Some(reply) = session.check_data_allowed() {
                write_line(&mut writer, &reply).await?;
                continue;
            }
            write_line(&mut writer, "354 End data with <CRLF>.<CRLF>").await?;
            data_mode = true;
            continue;
        }

        write_line(&mut writer, "500 5.5.2 Syntax error, command unrecognized").await?;
    }

    Ok(())
}

async fn write_line<W>(writer: &mut BufWriter<W>, line: &str) -> Result<()>
    where W: AsyncWrite + Unpin
{
    timeout(WRITE_TIMEOUT, async {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await
    }).await
        .map_err(|_| anyhow!("SMTP write timeout"))??;
    Ok(())
}

fn create_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    use std::{ fs::File, io::BufReader as StdBufReader };

    let cert_file = File::open(cert_path)?;
    let mut cert_reader = StdBufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("invalid cert: {}", e))?;

    let key_file = File::open(key_path)?;
    let mut key_reader = StdBufReader::new(key_file);

    let mut key: Option<PrivateKeyDer<'static>> = None;
    for item in rustls_pemfile::read_all(&mut key_reader) {
        let item = item.map_err(|e| anyhow!("invalid key: {}", e))?;
        match item {
            rustls_pemfile::Item::Pkcs1Key(k) => {
                key = Some(PrivateKeyDer::Pkcs1(k));
                break;
            }
            rustls_pemfile::Item::Pkcs8Key(k) => {
                key = Some(PrivateKeyDer::Pkcs8(k));
                break;
            }
            rustls_pemfile::Item::Sec1Key(k) => {
                key = Some(PrivateKeyDer::Sec1(k));
                break;
            }
            _ => {}
        }
    }
    let key = key.ok_or_else(|| anyhow!("no private key found"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("tls config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
