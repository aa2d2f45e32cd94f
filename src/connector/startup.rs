//! Connection establishment: socket, optional TLS, startup message and the
//! authentication sub-protocol.

use std::collections::VecDeque;
use std::sync::Arc;

use log::info;

use crate::auth::{self, GssTokenSource, ScramSha256};
use crate::cancellation::CancelToken;
use crate::config::{HostSpec, Options};
use crate::errors::{Error, ServerIdentifier, TimeoutKind};
use crate::messages::{
    frontend, Authentication, BackendMessage, GaussPasswordMethod, ReadBuffer, TransactionStatus,
    WriteBuffer, SCRAM_SHA_256,
};

use super::parameters::ServerParameters;
use super::statements::StatementCache;
use super::{stream, Connector, ConnectorState};

impl Connector {
    /// Open a physical connection and run the full handshake, honoring the
    /// connect `Timeout` and the cancellation token.
    pub async fn open(
        options: Arc<Options>,
        host: HostSpec,
        cancel: &CancelToken,
    ) -> Result<Connector, Error> {
        Self::open_with_gss(options, host, None, cancel).await
    }

    /// Like [`Connector::open`], with an injected GSS/SSPI token provider for
    /// servers that demand it.
    pub async fn open_with_gss(
        options: Arc<Options>,
        host: HostSpec,
        gss: Option<&mut dyn GssTokenSource>,
        cancel: &CancelToken,
    ) -> Result<Connector, Error> {
        let open = Self::open_inner(options.clone(), host, gss, false);
        let timed = async {
            match options.connect_timeout() {
                Some(timeout) => tokio::time::timeout(timeout, open)
                    .await
                    .map_err(|_| Error::Timeout(TimeoutKind::Open))?,
                None => open.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.canceled() => Err(Error::Canceled),
            result = timed => result,
        }
    }

    /// Open a connection with `replication=database`, for
    /// [`Connector::start_replication`].
    pub async fn open_replication(
        options: Arc<Options>,
        host: HostSpec,
        cancel: &CancelToken,
    ) -> Result<Connector, Error> {
        let open = Self::open_inner(options.clone(), host, None, true);
        let timed = async {
            match options.connect_timeout() {
                Some(timeout) => tokio::time::timeout(timeout, open)
                    .await
                    .map_err(|_| Error::Timeout(TimeoutKind::Open))?,
                None => open.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.canceled() => Err(Error::Canceled),
            result = timed => result,
        }
    }

    async fn open_inner(
        options: Arc<Options>,
        host: HostSpec,
        gss: Option<&mut dyn GssTokenSource>,
        replication: bool,
    ) -> Result<Connector, Error> {
        let identifier = ServerIdentifier::new(
            &host.host,
            host.port,
            options.database_or_username(),
            &options.username,
        );
        info!("Opening connection to {identifier}");

        let stream = stream::connect(&host, &options, &identifier).await?;

        let now = crate::clock::now();
        let mut connector = Connector {
            state: ConnectorState::Connecting,
            read_buf: ReadBuffer::new(options.read_buffer_size),
            write_buf: WriteBuffer::new(options.write_buffer_size),
            stream,
            host,
            identifier,
            process_id: 0,
            secret_key: 0,
            parameters: ServerParameters::new(),
            statements: StatementCache::new(
                options.max_auto_prepare,
                options.auto_prepare_min_usages,
            ),
            transaction_status: TransactionStatus::Idle,
            notice_hook: None,
            notifications: VecDeque::new(),
            connected_at: now,
            connected_at_wall: chrono::Utc::now().naive_utc(),
            last_activity: now,
            dirty: false,
            stats: crate::stats::global(),
            bytes_read_synced: 0,
            bytes_written_synced: 0,
            options,
        };

        connector.handshake(gss, replication).await?;
        Ok(connector)
    }

    async fn handshake(
        &mut self,
        mut gss: Option<&mut dyn GssTokenSource>,
        replication: bool,
    ) -> Result<(), Error> {
        let params = self.startup_params(replication);
        let pairs: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.write_buf.put_encoded(&frontend::startup_packet(&pairs));
        self.flush().await?;

        let mut scram: Option<ScramSha256> = None;
        let mut password: Option<String> = self.options.password.clone();
        if password.is_none() {
            if let Some(passfile) = &self.options.passfile {
                password = auth::lookup_passfile(
                    passfile,
                    &self.host.host,
                    self.host.port,
                    &self.identifier.database,
                    &self.options.username,
                )
                .await;
            }
        }

        let mut saw_key_data = false;
        loop {
            match self.next_message().await? {
                BackendMessage::Authentication(request) => {
                    if let Err(err) = self
                        .answer_authentication(request, &mut scram, &password, &mut gss)
                        .await
                    {
                        self.mark_broken("authentication failed");
                        return Err(err);
                    }
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = process_id;
                    self.secret_key = secret_key;
                    saw_key_data = true;
                }
                BackendMessage::ReadyForQuery(status) => {
                    if !saw_key_data {
                        self.mark_broken("ReadyForQuery before BackendKeyData");
                        return Err(Error::protocol(
                            "server sent ReadyForQuery before BackendKeyData",
                        ));
                    }
                    self.transaction_status = status;
                    self.state = ConnectorState::Ready;
                    info!("Connector {self} ready");
                    return Ok(());
                }
                BackendMessage::ErrorResponse(fields) => {
                    self.mark_broken("server refused the connection");
                    return Err(if fields.code.starts_with("28") {
                        Error::AuthenticationFailed {
                            identifier: self.identifier.clone(),
                            reason: fields.message,
                        }
                    } else {
                        Error::ConnectionFailed {
                            identifier: self.identifier.clone(),
                            reason: format!("{} ({})", fields.message, fields.code),
                        }
                    });
                }
                other => {
                    self.mark_broken("unexpected message during startup");
                    return Err(Error::protocol(format!(
                        "unexpected {} during startup",
                        other.name()
                    )));
                }
            }
        }
    }

    async fn answer_authentication(
        &mut self,
        request: Authentication,
        scram: &mut Option<ScramSha256>,
        password: &Option<String>,
        gss: &mut Option<&mut dyn GssTokenSource>,
    ) -> Result<(), Error> {
        match request {
            Authentication::Ok => Ok(()),
            Authentication::CleartextPassword => {
                let password = self.require_password(password)?;
                frontend::password_message(
                    &mut self.write_buf,
                    &auth::cleartext_payload(&password),
                );
                self.flush().await
            }
            Authentication::Md5Password { salt } => {
                let password = self.require_password(password)?;
                frontend::password_message(
                    &mut self.write_buf,
                    &auth::md5_payload(&self.options.username, &password, &salt),
                );
                self.flush().await
            }
            Authentication::GaussSha256 {
                method,
                salt,
                token,
                iteration,
            } => {
                let password = self.require_password(password)?;
                let payload = match method {
                    GaussPasswordMethod::Sha256 => {
                        auth::sha256::sha256_proof(&password, &salt, &token, iteration)
                            .map_err(|err| self.auth_failed(err.0))?
                    }
                    GaussPasswordMethod::Md5 => {
                        // The md5 branch salts with the first four bytes of
                        // the hex challenge.
                        let mut bytes = [0u8; 4];
                        for (i, chunk) in salt.as_bytes().chunks(2).take(4).enumerate() {
                            let hex = std::str::from_utf8(chunk)
                                .ok()
                                .and_then(|s| u8::from_str_radix(s, 16).ok())
                                .ok_or_else(|| {
                                    self.auth_failed("md5 challenge salt is not hex".to_string())
                                })?;
                            bytes[i] = hex;
                        }
                        auth::md5_payload(&self.options.username, &password, &bytes)
                    }
                };
                frontend::password_message(&mut self.write_buf, &payload);
                self.flush().await
            }
            Authentication::Sasl { mechanisms } => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(self.auth_failed(format!(
                        "server offers only unsupported SASL mechanisms: {mechanisms:?}"
                    )));
                }
                let password = self.require_password(password)?;
                let mut client = ScramSha256::new(&password);
                let first = client.client_first();
                frontend::sasl_initial_response(&mut self.write_buf, SCRAM_SHA_256, &first);
                *scram = Some(client);
                self.flush().await
            }
            Authentication::SaslContinue { data } => {
                let client = scram
                    .as_mut()
                    .ok_or_else(|| Error::protocol("SASLContinue without SASL start"))?;
                let response = client
                    .continue_exchange(&data)
                    .map_err(|err| self.auth_failed(err.0))?;
                frontend::sasl_response(&mut self.write_buf, &response);
                self.flush().await
            }
            Authentication::SaslFinal { data } => {
                let client = scram
                    .as_mut()
                    .ok_or_else(|| Error::protocol("SASLFinal without SASL start"))?;
                client.finish(&data).map_err(|err| self.auth_failed(err.0))?;
                Ok(())
            }
            Authentication::Gss | Authentication::Sspi => {
                let provider = gss
                    .as_mut()
                    .ok_or_else(|| self.auth_failed("server wants GSS but no token provider was supplied".to_string()))?;
                let token = provider
                    .step(None)
                    .map_err(|err| self.auth_failed(err.0))?
                    .ok_or_else(|| self.auth_failed("GSS provider produced no initial token".to_string()))?;
                frontend::password_message(&mut self.write_buf, &token);
                self.flush().await
            }
            Authentication::GssContinue { token } => {
                let provider = gss
                    .as_mut()
                    .ok_or_else(|| self.auth_failed("GSSContinue without a token provider".to_string()))?;
                match provider.step(Some(&token)).map_err(|err| self.auth_failed(err.0))? {
                    Some(response) => {
                        frontend::password_message(&mut self.write_buf, &response);
                        self.flush().await
                    }
                    None => Ok(()),
                }
            }
        }
    }

    fn require_password(&self, password: &Option<String>) -> Result<String, Error> {
        password.clone().ok_or_else(|| Error::AuthenticationFailed {
            identifier: self.identifier.clone(),
            reason: "server demands a password but none was configured".into(),
        })
    }

    fn auth_failed(&self, reason: String) -> Error {
        Error::AuthenticationFailed {
            identifier: self.identifier.clone(),
            reason,
        }
    }

    fn startup_params(&self, replication: bool) -> Vec<(String, String)> {
        let options = &self.options;
        let mut params = vec![
            ("user".to_string(), options.username.clone()),
            (
                "database".to_string(),
                options.database_or_username().to_string(),
            ),
            (
                "application_name".to_string(),
                options
                    .application_name
                    .clone()
                    .unwrap_or_else(|| "opengauss-driver".to_string()),
            ),
            (
                "client_encoding".to_string(),
                options
                    .client_encoding
                    .clone()
                    .unwrap_or_else(|| "UTF8".to_string()),
            ),
        ];
        if let Some(search_path) = &options.search_path {
            params.push(("search_path".to_string(), search_path.clone()));
        }
        if let Some(timezone) = &options.timezone {
            params.push(("TimeZone".to_string(), timezone.clone()));
        }
        if let Some(extra) = &options.options {
            params.push(("options".to_string(), extra.clone()));
        }
        if replication {
            params.push(("replication".to_string(), "database".to_string()));
        }
        params
    }
}
