use std::fmt;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{Span, info, info_span};

use crate::error::{BoxError, ChainError, Result};

type Operation<'a> = Box<dyn FnOnce() -> BoxFuture<'a, std::result::Result<(), BoxError>> + Send + 'a>;

enum Step<'a> {
    Operation(Operation<'a>),
    Stage(String),
}

/// Factory for [`ActiveChain`]s sharing one logging context.
///
/// Holds no state beyond the name and its span, so one instance per
/// subsystem can live for the whole process.
pub struct NamedChain {
    name: String,
    span: OnceLock<Span>,
}

impl NamedChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            span: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Span scoping every log line emitted by chains of this name.
    pub fn logger(&self) -> &Span {
        self.span
            .get_or_init(|| info_span!("chain", context = %self.name))
    }

    /// Start a new, empty chain.
    pub fn init<'a>(&self) -> ActiveChain<'a> {
        ActiveChain {
            steps: Vec::new(),
            span: self.logger().clone(),
        }
    }
}

impl fmt::Debug for NamedChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedChain").field("name", &self.name).finish()
    }
}

/// One execution of an ordered list of stages and operations.
///
/// Nothing runs until [`exec`](Self::exec), which consumes the chain.
#[must_use = "a chain does nothing until `exec` is awaited"]
pub struct ActiveChain<'a> {
    steps: Vec<Step<'a>>,
    span: Span,
}

impl<'a> ActiveChain<'a> {
    /// Append a fallible operation.
    pub fn add<F, Fut, E>(&mut self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'a,
        E: Into<BoxError>,
    {
        self.steps.push(Step::Operation(Box::new(move || {
            async move { op().await.map_err(Into::into) }.boxed()
        })));
    }

    /// Append a stage marker. Empty labels are ignored at execution.
    pub fn stage(&mut self, label: impl Into<String>) {
        self.steps.push(Step::Stage(label.into()));
    }

    /// Like [`stage`](Self::stage), taking `format_args!` output.
    pub fn stagef(&mut self, args: fmt::Arguments<'_>) {
        self.stage(args.to_string());
    }

    /// Append an operation that calls `op` up to `count` times, `interval` apart.
    ///
    /// `op` receives the 1-based attempt number. `label`, when non-empty, is
    /// logged before every retry but not before the first attempt. The chain
    /// fails with the last attempt's error once all attempts are exhausted.
    /// A `count` of zero still makes one attempt.
    pub fn retry<F, Fut, E>(
        &mut self,
        label: impl Into<String>,
        interval: Duration,
        count: u32,
        op: F,
    ) where
        F: FnMut(u32) -> Fut + Send + 'a,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'a,
        E: Into<BoxError> + Send + 'a,
    {
        let label = label.into();
        let span = self.span.clone();
        let attempts = count.max(1);
        self.add(move || {
            let mut op = op;
            async move {
                let mut attempt = 1;
                loop {
                    match op(attempt).await {
                        Ok(()) => return Ok(()),
                        Err(e) if attempt >= attempts => return Err(e),
                        Err(_) => {}
                    }
                    attempt += 1;
                    if !label.is_empty() {
                        info!(parent: &span, "{label} ...");
                    }
                    tokio::time::sleep(interval).await;
                }
            }
        });
    }

    /// Run all steps in insertion order, stopping at the first failed operation.
    pub async fn exec(self) -> Result<()> {
        let Self { steps, span } = self;
        let mut last_stage: Option<String> = None;
        for step in steps {
            match step {
                Step::Stage(stage) => {
                    if stage.is_empty() {
                        continue;
                    }
                    info!(parent: &span, "{stage} ...");
                    last_stage = Some(stage);
                }
                Step::Operation(op) => {
                    if let Err(source) = op().await {
                        return Err(match last_stage {
                            Some(stage) => ChainError::AtStage { stage, source },
                            None => ChainError::Failed(source),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
