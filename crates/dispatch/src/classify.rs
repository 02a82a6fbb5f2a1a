//! Response classification
//!
//! Maps an API response to what the dispatcher does next. Microsoft's
//! security APIs answer throttling with 403, so 403 is a rate-limit signal
//! here rather than an authorization failure.

/// What a response means for the current credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 200 with a body: keep it
    Content,
    /// 200 with an empty body, or 204
    NoContent,
    /// 403: back off, then retry once
    RateLimited,
    /// 400 on a subscribe call: the subscription already exists
    AlreadySubscribed,
    /// Anything else: log and give up on this credential
    Remote,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Content => "content",
            Outcome::NoContent => "no_content",
            Outcome::RateLimited => "rate_limited",
            Outcome::AlreadySubscribed => "already_subscribed",
            Outcome::Remote => "remote_error",
        }
    }
}

/// Classify a response by status, body emptiness and request kind.
pub fn classify(status: u16, body_is_empty: bool, subscribe: bool) -> Outcome {
    match status {
        200 if body_is_empty => Outcome::NoContent,
        200 => Outcome::Content,
        204 => Outcome::NoContent,
        403 => Outcome::RateLimited,
        400 if subscribe => Outcome::AlreadySubscribed,
        _ => Outcome::Remote,
    }
}
