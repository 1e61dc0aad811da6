use super::{PrefixStripper, ReasoningFilter, StreamingConfig};
use convocore::{NodeError, TokenStream};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cleans the raw token stream of a responder before it reaches the caller.
///
/// Per token: cancellation check, hidden-reasoning removal, leading-prefix
/// stripping, emit. A pipeline is consumed by [`StreamPipeline::process`] and
/// cannot be restarted.
pub struct StreamPipeline {
    reasoning: Option<ReasoningFilter>,
    prefix: PrefixStripper,
    cancellation: CancellationToken,
}

enum Pull {
    Token(String),
    Failed(NodeError),
    Finished,
    Cancelled,
}

impl StreamPipeline {
    pub fn new(config: &StreamingConfig, cancellation: CancellationToken) -> Self {
        Self {
            reasoning: config
                .reasoning
                .as_ref()
                .map(|tags| ReasoningFilter::new(tags.start.clone(), tags.end.clone())),
            prefix: PrefixStripper::new(config.strip_prefixes.clone(), config.prefix_buffer_limit),
            cancellation,
        }
    }

    pub fn process(self, raw: TokenStream) -> TokenStream {
        let Self {
            mut reasoning,
            mut prefix,
            cancellation,
        } = self;

        Box::pin(async_stream::stream! {
            let mut raw = raw;
            loop {
                let pull = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => Pull::Cancelled,
                    item = raw.next() => match item {
                        Some(Ok(token)) => Pull::Token(token),
                        Some(Err(e)) => Pull::Failed(e),
                        None => Pull::Finished,
                    },
                };

                match pull {
                    Pull::Cancelled => {
                        debug!("Stream cancelled; dropping the rest of the backend output");
                        break;
                    }
                    Pull::Failed(e) => {
                        yield Err(e);
                        break;
                    }
                    Pull::Token(token) => {
                        let visible = match reasoning.as_mut() {
                            Some(filter) => filter.push(&token),
                            None => token,
                        };
                        let out = prefix.push(&visible);
                        // A signal that landed while this token was in flight wins.
                        if cancellation.is_cancelled() {
                            break;
                        }
                        if !out.is_empty() {
                            yield Ok(out);
                        }
                    }
                    Pull::Finished => {
                        let tail = reasoning.as_mut().map(|f| f.finish()).unwrap_or_default();
                        let mut out = prefix.push(&tail);
                        out.push_str(&prefix.finish());
                        if !out.is_empty() && !cancellation.is_cancelled() {
                            yield Ok(out);
                        }
                        break;
                    }
                }
            }
        })
    }
}
