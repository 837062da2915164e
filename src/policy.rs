//! Admission policy: the HTTP authorization call made at publish time, the
//! ordered evaluation of inspection results, and the outbound notifications
//! to the admission service. Notifications are best-effort; callers log and
//! move on.

use serde_json::{json, Value};
use std::time::Duration;

use crate::inspect::InspectResult;

pub mod reason {
    pub const KEY_INVALID: &str = "KEY_INVALID";
    pub const CODEC_UNSUPPORTED: &str = "CODEC_UNSUPPORTED";
    pub const RESOLUTION_TOO_LARGE: &str = "RESOLUTION_TOO_LARGE";
    pub const GOP_TOO_LONG: &str = "GOP_TOO_LONG";
    pub const NO_KEYFRAME_TIMEOUT: &str = "NO_KEYFRAME_TIMEOUT";
    pub const AUDIO_UNSUPPORTED: &str = "AUDIO_UNSUPPORTED";
}

const VIDEO_INFO_URL: &str = "https://api.tokuly.com/live/stream/videoinfo";
const ARCHIVE_STATUS_URL: &str = "https://api.tokuly.com/live/stream/archive/status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decision {
    #[default]
    Accept,
    Reject,
    Degraded,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyOutcome {
    pub decision: Decision,
    pub reason: &'static str,
    pub message: String,
    pub stream_name: String,
    pub allow_rewind: Option<bool>,
}

impl PolicyOutcome {
    fn reject(reason: &'static str, message: &str) -> Self {
        Self {
            decision: Decision::Reject,
            reason,
            message: message.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyRules {
    pub max_width: u32,
    pub max_height: u32,
    pub max_gop_seconds: f64,
    pub allow_no_audio: bool,
    /// "reject" or "degraded"
    pub on_gop_too_long: String,
    pub reject_if_video_not_h264: bool,
    pub reject_if_audio_not_aac: bool,
}

pub struct HttpPolicy {
    client: reqwest::Client,
    pub auth_url: String,
    pub stream_end_url: String,
    pub api_key: String,
    pub version: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub debug_skip: bool,
    pub rules: PolicyRules,
}

impl HttpPolicy {
    pub fn new(
        auth_url: String,
        stream_end_url: String,
        api_key: String,
        version: String,
        timeout: Duration,
        user_agent: String,
        debug_skip: bool,
        rules: PolicyRules,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            auth_url,
            stream_end_url,
            api_key,
            version,
            timeout,
            user_agent,
            debug_skip,
            rules,
        }
    }

    /// Ask the admission service whether this stream key may publish. Any
    /// transport failure or non-200 response denies with `KEY_INVALID`.
    pub async fn authorize(
        &self,
        stream_key: &str,
        remote_ip: &str,
        rtmp_user_agent: &str,
        app: &str,
    ) -> PolicyOutcome {
        if self.debug_skip || self.auth_url.is_empty() {
            return PolicyOutcome::default();
        }

        let mut form: Vec<(&str, &str)> = vec![("key", stream_key)];
        if !self.api_key.is_empty() {
            form.push(("APIkey", self.api_key.as_str()));
        }
        if !self.version.is_empty() {
            form.push(("version", self.version.as_str()));
        }

        let mut request = self
            .client
            .post(&self.auth_url)
            .timeout(self.timeout)
            .form(&form);
        if !self.user_agent.is_empty() {
            request = request.header("User-Agent", &self.user_agent);
        }
        if !remote_ip.is_empty() {
            request = request.header("X-Forwarded-For", remote_ip);
        }
        if !rtmp_user_agent.is_empty() {
            request = request.header("X-RTMP-User-Agent", rtmp_user_agent);
        }
        if !app.is_empty() {
            request = request.header("X-RTMP-App", app);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                log::warn!("auth request error: {}", err);
                return PolicyOutcome::reject(reason::KEY_INVALID, "auth request error");
            }
        };
        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();
        if status != reqwest::StatusCode::OK {
            return PolicyOutcome::reject(
                reason::KEY_INVALID,
                &format!("auth status {}", status.as_u16()),
            );
        }
        parse_auth_response(&body)
    }

    /// Apply the six admission checks in order; the first violated check
    /// decides the outcome.
    pub fn evaluate(&self, result: &InspectResult) -> PolicyOutcome {
        let rules = &self.rules;
        if rules.reject_if_video_not_h264 && result.video_codec != "H264" {
            return PolicyOutcome::reject(reason::CODEC_UNSUPPORTED, "video codec not supported");
        }
        if result.width > 0
            && result.height > 0
            && (result.width > rules.max_width || result.height > rules.max_height)
        {
            return PolicyOutcome::reject(reason::RESOLUTION_TOO_LARGE, "resolution too large");
        }
        if !result.keyframe_received {
            return PolicyOutcome::reject(reason::NO_KEYFRAME_TIMEOUT, "first keyframe timeout");
        }
        if result.audio_codec.is_empty() && !rules.allow_no_audio {
            return PolicyOutcome::reject(reason::AUDIO_UNSUPPORTED, "audio required");
        }
        if rules.reject_if_audio_not_aac
            && !result.audio_codec.is_empty()
            && result.audio_codec != "AAC"
        {
            return PolicyOutcome::reject(reason::AUDIO_UNSUPPORTED, "audio codec not supported");
        }
        if rules.max_gop_seconds > 0.0
            && result.gop_seconds > 0.0
            && result.gop_seconds > rules.max_gop_seconds
        {
            if rules.on_gop_too_long == "reject" {
                return PolicyOutcome::reject(reason::GOP_TOO_LONG, "gop too long");
            }
            return PolicyOutcome {
                decision: Decision::Degraded,
                reason: reason::GOP_TOO_LONG,
                message: "gop too long".to_string(),
                ..PolicyOutcome::default()
            };
        }
        PolicyOutcome::default()
    }

    pub async fn notify_stream_end(&self, stream_key: &str) -> Result<(), reqwest::Error> {
        if self.debug_skip || self.stream_end_url.is_empty() {
            return Ok(());
        }
        let mut form: Vec<(&str, &str)> = vec![("key", stream_key)];
        if !self.api_key.is_empty() {
            form.push(("APIkey", self.api_key.as_str()));
        }
        if !self.version.is_empty() {
            form.push(("version", self.version.as_str()));
        }
        let mut request = self
            .client
            .post(&self.stream_end_url)
            .timeout(self.timeout)
            .form(&form);
        if !self.user_agent.is_empty() {
            request = request.header("User-Agent", &self.user_agent);
        }
        request.send().await?;
        Ok(())
    }

    pub async fn notify_video_info(
        &self,
        stream_name: &str,
        result: &InspectResult,
    ) -> Result<(), reqwest::Error> {
        if self.debug_skip || self.api_key.is_empty() {
            return Ok(());
        }
        let payload = json!({
            "name": stream_name,
            "size_w": result.width.to_string(),
            "size_h": result.height.to_string(),
            "video_fps": format_fps(result.video_fps),
            "key": self.api_key,
        });
        let mut request = self
            .client
            .post(VIDEO_INFO_URL)
            .timeout(self.timeout)
            .json(&payload);
        if !self.user_agent.is_empty() {
            request = request.header("User-Agent", &self.user_agent);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }

    pub async fn notify_archive_status(
        &self,
        stream_name: &str,
        status: bool,
    ) -> Result<(), reqwest::Error> {
        if self.debug_skip || self.api_key.is_empty() {
            return Ok(());
        }
        let payload = json!({
            "name": stream_name,
            "status": status,
            "key": self.api_key,
        });
        let mut request = self
            .client
            .post(ARCHIVE_STATUS_URL)
            .timeout(self.timeout)
            .json(&payload);
        if !self.user_agent.is_empty() {
            request = request.header("User-Agent", &self.user_agent);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }
}

fn format_fps(value: f64) -> String {
    if value <= 0.0 {
        return "0".to_string();
    }
    format!("{}", value)
}

fn parse_auth_response(body: &[u8]) -> PolicyOutcome {
    let mut outcome = PolicyOutcome::default();
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return outcome;
    }
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        outcome.message = "auth response parse error".to_string();
        return outcome;
    };
    if let Some(name) = value.get("stream_name").and_then(Value::as_str) {
        outcome.stream_name = name.to_string();
    }
    if let Some(allow) = value.get("allow_rewind").and_then(parse_bool_value) {
        outcome.allow_rewind = Some(allow);
    }
    outcome
}

fn parse_bool_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> PolicyRules {
        PolicyRules {
            max_width: 1920,
            max_height: 1920,
            max_gop_seconds: 2.0,
            allow_no_audio: false,
            on_gop_too_long: "degraded".to_string(),
            reject_if_video_not_h264: true,
            reject_if_audio_not_aac: true,
        }
    }

    fn policy_with(rules: PolicyRules) -> HttpPolicy {
        HttpPolicy::new(
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            Duration::from_secs(1),
            String::new(),
            true,
            rules,
        )
    }

    fn good_result() -> InspectResult {
        InspectResult {
            video_codec: "H264".to_string(),
            audio_codec: "AAC".to_string(),
            width: 1280,
            height: 720,
            keyframe_received: true,
            gop_seconds: 1.0,
            ..InspectResult::default()
        }
    }

    #[test]
    fn accepts_conforming_stream() {
        let policy = policy_with(rules());
        let outcome = policy.evaluate(&good_result());
        assert_eq!(outcome.decision, Decision::Accept);
    }

    #[test]
    fn rejects_in_documented_order() {
        let policy = policy_with(rules());

        let mut r = good_result();
        r.video_codec = "HEVC".to_string();
        r.width = 4096; // later violation must not change the reason
        assert_eq!(
            policy.evaluate(&r).reason,
            reason::CODEC_UNSUPPORTED
        );

        let mut r = good_result();
        r.width = 4096;
        r.height = 2160;
        r.keyframe_received = false;
        assert_eq!(policy.evaluate(&r).reason, reason::RESOLUTION_TOO_LARGE);

        let mut r = good_result();
        r.keyframe_received = false;
        assert_eq!(policy.evaluate(&r).reason, reason::NO_KEYFRAME_TIMEOUT);

        let mut r = good_result();
        r.audio_codec = String::new();
        assert_eq!(policy.evaluate(&r).reason, reason::AUDIO_UNSUPPORTED);

        let mut r = good_result();
        r.audio_codec = "MP3".to_string();
        assert_eq!(policy.evaluate(&r).reason, reason::AUDIO_UNSUPPORTED);
    }

    #[test]
    fn unknown_resolution_is_not_rejected() {
        let policy = policy_with(rules());
        let mut r = good_result();
        r.width = 0;
        r.height = 0;
        assert_eq!(policy.evaluate(&r).decision, Decision::Accept);
    }

    #[test]
    fn long_gop_degrades_or_rejects() {
        let policy = policy_with(rules());
        let mut r = good_result();
        r.gop_seconds = 4.0;
        let outcome = policy.evaluate(&r);
        assert_eq!(outcome.decision, Decision::Degraded);
        assert_eq!(outcome.reason, reason::GOP_TOO_LONG);

        let mut strict = rules();
        strict.on_gop_too_long = "reject".to_string();
        let policy = policy_with(strict);
        assert_eq!(policy.evaluate(&r).decision, Decision::Reject);
    }

    #[test]
    fn no_audio_allowed_when_configured() {
        let mut relaxed = rules();
        relaxed.allow_no_audio = true;
        let policy = policy_with(relaxed);
        let mut r = good_result();
        r.audio_codec = String::new();
        assert_eq!(policy.evaluate(&r).decision, Decision::Accept);
    }

    #[tokio::test]
    async fn debug_skip_authorizes_unconditionally() {
        let policy = policy_with(rules());
        let outcome = policy.authorize("anykey", "", "", "").await;
        assert_eq!(outcome.decision, Decision::Accept);
    }

    #[test]
    fn auth_response_parsing() {
        let outcome = parse_auth_response(br#"{"stream_name":"abc","allow_rewind":"1"}"#);
        assert_eq!(outcome.stream_name, "abc");
        assert_eq!(outcome.allow_rewind, Some(true));

        let outcome = parse_auth_response(br#"{"allow_rewind":false}"#);
        assert_eq!(outcome.allow_rewind, Some(false));

        let outcome = parse_auth_response(br#"{"allow_rewind":0}"#);
        assert_eq!(outcome.allow_rewind, Some(false));

        let outcome = parse_auth_response(b"  ");
        assert_eq!(outcome.decision, Decision::Accept);
        assert!(outcome.allow_rewind.is_none());

        // malformed body still accepts (the 200 decided)
        let outcome = parse_auth_response(b"not-json");
        assert_eq!(outcome.decision, Decision::Accept);
    }
}
