//! Line-oriented stanza shell.
//!
//! Each stdin line is one XML stanza routed to the service named by its
//! `to` address. Everything the services emit is written to stdout, one
//! stanza per line.

use anyhow::Result;
use minidom::Element;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waddle_pubsub::PubSubComponents;

/// Feed stanzas from `input` into the services until EOF or cancellation.
///
/// Returns the number of stanzas routed.
pub async fn run_input<R>(
    components: &PubSubComponents,
    input: R,
    shutdown: CancellationToken,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut routed = 0;
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("Input closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let stanza: Element = match line.parse() {
            Ok(stanza) => stanza,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed stanza");
                continue;
            }
        };
        match components.route(stanza).await {
            Ok(true) => routed += 1,
            Ok(false) => warn!("No pub/sub service for stanza recipient"),
            Err(e) => warn!(error = %e, "Failed to hand stanza to service"),
        }
    }
    info!(routed, "Stanza input finished");
    Ok(routed)
}

/// Write outbound stanzas until every sender is gone.
pub async fn run_output<W>(mut outbound: mpsc::Receiver<Element>, mut output: W) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(stanza) = outbound.recv().await {
        let mut line = String::from(&stanza);
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
        written += 1;
    }
    Ok(written)
}
