use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::{KeyValuePersistence, OtpChannelStatus};

pub const TELEGRAM_API: &str = "https://api.telegram.org";
pub const TWILIO_API: &str = "https://api.twilio.com";

/// Upper bound on any single channel call.
pub const CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);

// ── Channel configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from: String,
    pub to: String,
    pub api_base: String,
}

impl TelegramConfig {
    /// Both the bot token and chat id must be non-empty.
    pub fn from_parts(bot_token: Option<String>, chat_id: Option<String>) -> Option<Self> {
        let bot_token = bot_token.filter(|s| !s.is_empty())?;
        let chat_id = chat_id.filter(|s| !s.is_empty())?;
        Some(Self {
            bot_token,
            chat_id,
            api_base: TELEGRAM_API.into(),
        })
    }
}

impl TwilioConfig {
    pub fn from_parts(
        account_sid: Option<String>,
        auth_token: Option<String>,
        from: Option<String>,
        to: Option<String>,
    ) -> Option<Self> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
        Some(Self {
            account_sid: non_empty(account_sid)?,
            auth_token: non_empty(auth_token)?,
            from: non_empty(from)?,
            to: non_empty(to)?,
            api_base: TWILIO_API.into(),
        })
    }
}

// ── Errors and results ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP {status}")]
    Http { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no configured channel")]
    NotConfigured,
}

/// What `start_otp` reports back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtpDispatch {
    pub ok: bool,
    pub channel: Option<String>,
    pub error: Option<String>,
}

// ── Notifier ─────────────────────────────────────────────────────────────────

/// Delivers OTP codes through Telegram, then Twilio, then a local debug log.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    telegram: Option<TelegramConfig>,
    twilio: Option<TwilioConfig>,
    debug_log: PathBuf,
    status: Arc<dyn KeyValuePersistence<OtpChannelStatus>>,
}

impl Notifier {
    pub fn new(
        telegram: Option<TelegramConfig>,
        twilio: Option<TwilioConfig>,
        debug_log: PathBuf,
        status: Arc<dyn KeyValuePersistence<OtpChannelStatus>>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CHANNEL_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("build notification client: {e}"))?;

        Ok(Self {
            client,
            telegram,
            twilio,
            debug_log,
            status,
        })
    }

    pub fn has_channel(&self) -> bool {
        self.telegram.is_some() || self.twilio.is_some()
    }

    /// Try each configured channel in order; the first success wins.
    pub async fn deliver_code(&self, code: &str) -> OtpDispatch {
        let body = format!("Admin panel login code: {code}");
        let mut last: Option<(&'static str, DeliveryError)> = None;

        if let Some(tg) = &self.telegram {
            match self.send_telegram(tg, &body).await {
                Ok(()) => return self.delivered("telegram"),
                Err(e) => {
                    warn!(channel = "telegram", error = %e, "otp delivery failed");
                    last = Some(("telegram", e));
                }
            }
        }

        if let Some(tw) = &self.twilio {
            match self.send_twilio(tw, &body).await {
                Ok(()) => return self.delivered("twilio"),
                Err(e) => {
                    warn!(channel = "twilio", error = %e, "otp delivery failed");
                    last = Some(("twilio", e));
                }
            }
        }

        self.write_debug_log(code);

        let dispatch = match last {
            Some((channel, e)) => OtpDispatch {
                ok: false,
                channel: Some(channel.into()),
                error: Some(e.to_string()),
            },
            None => OtpDispatch {
                ok: false,
                channel: None,
                error: Some(DeliveryError::NotConfigured.to_string()),
            },
        };
        self.record(&dispatch);
        dispatch
    }

    /// Diagnostic message through Telegram only, unrelated to any OTP session.
    pub async fn test_telegram(&self) -> Result<(), DeliveryError> {
        let tg = self.telegram.as_ref().ok_or(DeliveryError::NotConfigured)?;
        self.send_telegram(tg, "Atelier OTP test message").await
    }

    /// The outcome recorded by the last `deliver_code` call.
    pub fn last_status(&self) -> OtpChannelStatus {
        self.status.load().ok().flatten().unwrap_or_default()
    }

    fn delivered(&self, channel: &str) -> OtpDispatch {
        info!(channel, "otp delivered");
        let dispatch = OtpDispatch {
            ok: true,
            channel: Some(channel.into()),
            error: None,
        };
        self.record(&dispatch);
        dispatch
    }

    fn record(&self, dispatch: &OtpDispatch) {
        let status = OtpChannelStatus {
            channel: dispatch.channel.clone(),
            error: dispatch.error.clone(),
        };
        if let Err(e) = self.status.save(&status) {
            warn!(error = %e, "could not persist otp channel status");
        }
    }

    async fn send_telegram(&self, tg: &TelegramConfig, text: &str) -> Result<(), DeliveryError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            tg.api_base.trim_end_matches('/'),
            tg.bot_token
        );
        let form = [
            ("chat_id", tg.chat_id.as_str()),
            ("text", text),
            ("disable_web_page_preview", "true"),
            ("parse_mode", "HTML"),
        ];
        let result = self.client.post(&url).form(&form).send().await;
        check_response(result)
    }

    async fn send_twilio(&self, tw: &TwilioConfig, text: &str) -> Result<(), DeliveryError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            tw.api_base.trim_end_matches('/'),
            tw.account_sid
        );
        let form = [
            ("To", tw.to.as_str()),
            ("From", tw.from.as_str()),
            ("Body", text),
        ];
        let result = self
            .client
            .post(&url)
            .basic_auth(&tw.account_sid, Some(&tw.auth_token))
            .form(&form)
            .send()
            .await;
        check_response(result)
    }

    fn write_debug_log(&self, code: &str) {
        let line = format!("{} OTP: {}\n", chrono::Local::now().to_rfc3339(), code);
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.debug_log)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        match written {
            Ok(()) => warn!(
                path = %self.debug_log.display(),
                "otp not delivered; code written to debug log"
            ),
            Err(e) => warn!(error = %e, "otp not delivered and debug log unwritable"),
        }
    }
}

fn check_response(result: reqwest::Result<reqwest::Response>) -> Result<(), DeliveryError> {
    match result {
        Ok(resp) if resp.status().is_success() => {
            debug!(status = %resp.status(), "channel accepted message");
            Ok(())
        }
        Ok(resp) => Err(DeliveryError::Http {
            status: resp.status().as_u16(),
        }),
        Err(e) => Err(DeliveryError::Transport(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonFile;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn telegram(base: &str) -> TelegramConfig {
        TelegramConfig {
            bot_token: "123:abc".into(),
            chat_id: "42".into(),
            api_base: base.into(),
        }
    }

    fn twilio(base: &str) -> TwilioConfig {
        TwilioConfig {
            account_sid: "AC1".into(),
            auth_token: "secret".into(),
            from: "+100".into(),
            to: "+200".into(),
            api_base: base.into(),
        }
    }

    fn notifier(
        dir: &tempfile::TempDir,
        tg: Option<TelegramConfig>,
        tw: Option<TwilioConfig>,
    ) -> Notifier {
        let status = Arc::new(JsonFile::new(dir.path().join("otp_status.json")));
        Notifier::new(tg, tw, dir.path().join("otp_debug.log"), status).unwrap()
    }

    #[test]
    fn partial_config_is_not_a_channel() {
        assert!(TelegramConfig::from_parts(Some("tok".into()), None).is_none());
        assert!(TelegramConfig::from_parts(Some("tok".into()), Some(String::new())).is_none());
        assert!(TwilioConfig::from_parts(
            Some("sid".into()),
            Some("tok".into()),
            Some("+1".into()),
            None
        )
        .is_none());
        assert!(TelegramConfig::from_parts(Some("t".into()), Some("c".into())).is_some());
    }

    #[tokio::test]
    async fn telegram_success_is_recorded() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_string_contains("chat_id=42"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let n = notifier(&dir, Some(telegram(&mock.uri())), None);
        let out = n.deliver_code("123456").await;

        assert_eq!(
            out,
            OtpDispatch {
                ok: true,
                channel: Some("telegram".into()),
                error: None
            }
        );
        assert_eq!(n.last_status().channel.as_deref(), Some("telegram"));
        assert!(!dir.path().join("otp_debug.log").exists());
    }

    #[tokio::test]
    async fn telegram_failure_falls_back_to_twilio() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC1/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("To=%2B200"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&mock)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let n = notifier(&dir, Some(telegram(&mock.uri())), Some(twilio(&mock.uri())));
        let out = n.deliver_code("111111").await;
        assert!(out.ok);
        assert_eq!(out.channel.as_deref(), Some("twilio"));
    }

    #[tokio::test]
    async fn all_channels_failing_reports_last_error_and_logs_code() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let n = notifier(&dir, Some(telegram(&mock.uri())), None);
        let out = n.deliver_code("222222").await;

        assert!(!out.ok);
        assert_eq!(out.channel.as_deref(), Some("telegram"));
        assert_eq!(out.error.as_deref(), Some("HTTP 403"));
        let log = std::fs::read_to_string(dir.path().join("otp_debug.log")).unwrap();
        assert!(log.contains("OTP: 222222"));
    }

    #[tokio::test]
    async fn unreachable_channel_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let n = notifier(&dir, Some(telegram("http://127.0.0.1:1")), None);
        let err = n.test_telegram().await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }

    #[tokio::test]
    async fn no_channel_writes_debug_log() {
        let dir = tempfile::tempdir().unwrap();
        let n = notifier(&dir, None, None);
        assert!(!n.has_channel());

        let out = n.deliver_code("333333").await;
        assert_eq!(
            out,
            OtpDispatch {
                ok: false,
                channel: None,
                error: Some("no configured channel".into())
            }
        );
        let log = std::fs::read_to_string(dir.path().join("otp_debug.log")).unwrap();
        assert!(log.trim_end().ends_with("OTP: 333333"));
        assert_eq!(n.last_status().error.as_deref(), Some("no configured channel"));
    }

    #[tokio::test]
    async fn test_telegram_requires_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let n = notifier(&dir, None, None);
        assert_eq!(n.test_telegram().await, Err(DeliveryError::NotConfigured));
    }
}
