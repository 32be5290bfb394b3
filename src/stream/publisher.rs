//! Paced publishing driver.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::HotflowResult;
use crate::scheduler::{yield_now, SchedulerHandle, Ticks};

use super::hot::{HotStream, SharedStream};

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Logical delay before each publish; `0` is a bare scheduler yield.
    pub pacing_ticks: Ticks,
    /// Close the stream once the last value is published.
    pub close_on_complete: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            pacing_ticks: 100,
            close_on_complete: true,
        }
    }
}

/// Outcome of [`Publisher::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Values published.
    pub published: usize,
    /// Logical time spent, suspensions included.
    pub elapsed_ticks: Ticks,
}

/// State stream fed alongside the driven one.
struct Mirror<T> {
    stream: HotStream<T>,
    same: fn(&T, &T) -> bool,
}

/// Drives a fixed sequence of publishes against one stream it owns.
pub struct Publisher<T> {
    stream: HotStream<T>,
    mirror: Option<Mirror<T>>,
    scheduler: SchedulerHandle,
    config: PublisherConfig,
}

impl<T: Clone + fmt::Debug> Publisher<T> {
    /// Takes exclusive write access to `stream`.
    #[must_use]
    pub fn new(stream: HotStream<T>, scheduler: SchedulerHandle, config: PublisherConfig) -> Self {
        Self {
            stream,
            mirror: None,
            scheduler,
            config,
        }
    }

    /// Read-only view of the driven stream.
    #[must_use]
    pub fn stream(&self) -> SharedStream<T> {
        self.stream.share()
    }

    /// Read-only view of the mirror stream, if any.
    #[must_use]
    pub fn mirror(&self) -> Option<SharedStream<T>> {
        self.mirror.as_ref().map(|m| m.stream.share())
    }

    /// Publishes `values` in order, pacing each one.
    ///
    /// Whether a publish suspends depends only on the stream's overflow policy
    /// and its subscribers; the first value gets no special treatment.
    pub async fn run<I>(self, values: I) -> HotflowResult<PublishReport>
    where
        I: IntoIterator<Item = T>,
    {
        let started = self.scheduler.now();
        let mut published = 0;

        for value in values {
            self.pace().await;
            self.stream.publish(value.clone()).await?;
            if let Some(mirror) = &self.mirror {
                // Equal values are conflated, like assigning a state holder.
                let unchanged = mirror.stream.value().is_some_and(|current| (mirror.same)(&current, &value));
                if !unchanged {
                    mirror.stream.try_publish(value.clone())?;
                }
            }
            published += 1;
            debug!(?value, now = self.scheduler.now(), "published");
        }

        if self.config.close_on_complete {
            self.stream.close();
        }

        Ok(PublishReport {
            published,
            elapsed_ticks: self.scheduler.now() - started,
        })
    }

    async fn pace(&self) {
        if self.config.pacing_ticks == 0 {
            yield_now().await;
        } else {
            self.scheduler.sleep(self.config.pacing_ticks).await;
        }
    }
}

impl<T: Clone + fmt::Debug + PartialEq> Publisher<T> {
    /// Also records every published value into `state`, typically a
    /// [`HotStreamConfig::state`](crate::policy::HotStreamConfig::state) stream.
    /// A value equal to the one `state` already holds is skipped.
    #[must_use]
    pub fn mirror_to(mut self, state: HotStream<T>) -> Self {
        self.mirror = Some(Mirror {
            stream: state,
            same: <T as PartialEq>::eq,
        });
        self
    }
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("config", &self.config)
            .field("mirrored", &self.mirror.is_some())
            .finish()
    }
}
