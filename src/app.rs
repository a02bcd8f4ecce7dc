use crate::bot::HomeworkBot;
use crate::completion::OpenRouterClient;
use crate::config::{AppConfig, HTTPConfig};
use crate::http::{create_app, HttpState};
use crate::line::{LineMessagingClient, SignatureVerifier};
use crate::TracingReloadHandle;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::log::{error, info};

const SHUTDOWN_TASK: &str = "Shutdown Signal";

pub struct AppHandles {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}
impl AppHandles {
    pub async fn new(
        config: AppConfig,
        tracing_reload: TracingReloadHandle,
        sentry_enabled: bool,
    ) -> Result<AppHandles> {
        let credentials = config.credentials;

        let completion = OpenRouterClient::new(
            &config.completion,
            credentials.completion_api_key.clone(),
        )
        .context("Failed to build completion HTTP client")?;

        let messaging = LineMessagingClient::new(
            &config.line.api_base,
            credentials.channel_access_token.clone(),
            config.line.reply_timeout(),
        )
        .context("Failed to build LINE HTTP client")?;

        info!(
            "Using model {} via {} (timeout {}s, {} attempt(s))",
            config.completion.model,
            config.completion.base_url,
            config.completion.timeout_secs,
            config.completion.max_attempts
        );

        let bot = HomeworkBot::new(
            Arc::new(completion),
            Arc::new(messaging),
            config.completion.fallback_message().map(str::to_string),
        );
        let state = HttpState {
            bot: Arc::new(bot),
            verifier: SignatureVerifier::new(&credentials.channel_secret),
            tracing_reload,
        };

        let http_handle = Self::start_http_server(
            config.http,
            credentials.admin_token,
            state,
            sentry_enabled,
        )?;

        let shutdown_handle = tokio::spawn(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        });

        Ok(AppHandles {
            tasks: vec![("HTTP Server", http_handle), (SHUTDOWN_TASK, shutdown_handle)],
        })
    }

    pub async fn run(self) {
        let futures: Vec<_> = self
            .tasks
            .into_iter()
            .map(|(name, handle)| {
                info!("Starting task: {name}");
                Box::pin(async move {
                    match handle.await {
                        Ok(_) if name == SHUTDOWN_TASK => info!("Received shutdown signal"),
                        Ok(_) => error!("{name} task completed!"),
                        Err(e) => error!("{name} task failed: {e:?}!"),
                    }
                })
            })
            .collect();

        // Wait for any task to complete. All handles are boxed, so when dropped they are cancelled.
        let (_, _, remaining) = futures::future::select_all(futures).await;
        drop(remaining);
    }

    fn start_http_server(
        config: HTTPConfig,
        admin_token: Option<String>,
        state: HttpState,
        _sentry_enabled: bool,
    ) -> Result<JoinHandle<()>> {
        let address = config.address;
        let tls_config = config.tls.clone();

        let app = create_app(&config, admin_token, state, _sentry_enabled)?;
        info!("Webhook callback route: POST {}", config.callback_path);

        let handle = tokio::spawn(async move {
            let result = match tls_config {
                Some(_tls_config) => {
                    #[cfg(any(feature = "tls-rustls", feature = "tls-native"))]
                    {
                        info!("Starting HTTPS (secure) server on {address}");

                        #[cfg(feature = "tls-rustls")]
                        {
                            let _ = rustls::crypto::CryptoProvider::install_default(
                                rustls::crypto::aws_lc_rs::default_provider(),
                            );
                            match axum_server::tls_rustls::RustlsConfig::from_pem_file(
                                &_tls_config.certificate_path,
                                &_tls_config.key_path,
                            )
                            .await
                            {
                                Ok(tls) => axum_server::bind_rustls(address, tls)
                                    .serve(app.into_make_service())
                                    .await
                                    .map_err(anyhow::Error::from),
                                Err(e) => Err(anyhow::Error::from(e)
                                    .context("Failed to load rustls TLS certificates!")),
                            }
                        }

                        #[cfg(all(feature = "tls-native", not(feature = "tls-rustls")))]
                        {
                            match axum_server::tls_openssl::OpenSSLConfig::from_pem_file(
                                &_tls_config.certificate_path,
                                &_tls_config.key_path,
                            ) {
                                Ok(tls) => axum_server::bind_openssl(address, tls)
                                    .serve(app.into_make_service())
                                    .await
                                    .map_err(anyhow::Error::from),
                                Err(e) => Err(anyhow::Error::from(e)
                                    .context("Failed to load openssl TLS certificates!")),
                            }
                        }
                    }

                    #[cfg(not(any(feature = "tls-rustls", feature = "tls-native")))]
                    Err(anyhow::anyhow!(
                        "HTTP Server TLS configuration provided but no TLS features enabled. Compile with a TLS backend feature!"
                    ))
                }
                None => {
                    info!("Starting HTTP (insecure) server on {address}");
                    axum_server::bind(address)
                        .serve(app.into_make_service())
                        .await
                        .map_err(anyhow::Error::from)
                }
            };

            if let Err(e) = result {
                error!("Server error: {e:?}");
            }
        });

        Ok(handle)
    }
}
