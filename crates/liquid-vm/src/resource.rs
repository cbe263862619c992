use std::fmt;

/// Error returned when a render exceeds one of its cost ceilings.
///
/// Each variant records the ceiling and the counter value that breached it.
/// The counter is never rolled back, so `score`/`length` is the value after
/// the offending increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Too many output-producing nodes rendered.
    RenderScore { limit: usize, score: usize },
    /// Too much data retained by assignments and captures.
    AssignScore { limit: usize, score: usize },
    /// Too many bytes written to the final output buffer.
    RenderLength { limit: usize, length: usize },
    /// A limit was breached earlier and the render was told to stop.
    LimitsReached,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RenderScore { limit, score } => {
                write!(f, "render score limit exceeded: {score} > {limit}")
            }
            Self::AssignScore { limit, score } => {
                write!(f, "assign score limit exceeded: {score} > {limit}")
            }
            Self::RenderLength { limit, length } => {
                write!(f, "render length limit exceeded: {length} bytes > {limit} bytes")
            }
            Self::LimitsReached => write!(f, "memory limits exceeded"),
        }
    }
}

impl std::error::Error for ResourceError {}

/// Ceilings for [`ResourceLimits`].
///
/// All limits are optional - set to `None` to disable a specific limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of bytes in the final output.
    pub render_length_limit: Option<usize>,
    /// Maximum number of materialized nodes rendered.
    pub render_score_limit: Option<usize>,
    /// Maximum retained size of assigned and captured values.
    pub assign_score_limit: Option<usize>,
}

/// Per-render cost accounting.
///
/// Three counters grow monotonically until [`ResourceLimits::reset`]:
/// `render_score`, `assign_score` and `render_length`. Every `increment_*`
/// applies the increment first and checks the ceiling second, so a failed
/// check leaves the counter at its breached value and marks the limits as
/// [`reached`](ResourceLimits::reached).
///
/// While a capture is active (see [`ResourceLimits::with_capture`]) output
/// growth is charged to `assign_score` instead of `render_length`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    limits: LimitsConfig,
    render_score: usize,
    assign_score: usize,
    render_length: usize,
    /// Output length seen at the last write of the active capture.
    #[serde(skip)]
    last_capture_length: Option<usize>,
    reached: bool,
}

impl ResourceLimits {
    #[must_use]
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn config(&self) -> LimitsConfig {
        self.limits
    }

    #[must_use]
    pub fn render_score(&self) -> usize {
        self.render_score
    }

    #[must_use]
    pub fn assign_score(&self) -> usize {
        self.assign_score
    }

    #[must_use]
    pub fn render_length(&self) -> usize {
        self.render_length
    }

    /// Whether any ceiling was breached since the last reset.
    #[must_use]
    pub fn reached(&self) -> bool {
        self.reached
    }

    #[must_use]
    pub fn in_capture(&self) -> bool {
        self.last_capture_length.is_some()
    }

    pub fn increment_render_score(&mut self, amount: usize) -> Result<(), ResourceError> {
        self.render_score = self.render_score.saturating_add(amount);
        if let Some(limit) = self.limits.render_score_limit
            && self.render_score > limit
        {
            self.reached = true;
            return Err(ResourceError::RenderScore {
                limit,
                score: self.render_score,
            });
        }
        Ok(())
    }

    pub fn increment_assign_score(&mut self, amount: usize) -> Result<(), ResourceError> {
        self.assign_score = self.assign_score.saturating_add(amount);
        if let Some(limit) = self.limits.assign_score_limit
            && self.assign_score > limit
        {
            self.reached = true;
            return Err(ResourceError::AssignScore {
                limit,
                score: self.assign_score,
            });
        }
        Ok(())
    }

    /// Accounts for a buffer that has grown to `output_len` bytes.
    ///
    /// Inside a capture the growth since the previous write is charged to
    /// `assign_score`; otherwise the final buffer length is checked against the
    /// render length ceiling.
    pub fn increment_write_score(&mut self, output_len: usize) -> Result<(), ResourceError> {
        if let Some(last) = self.last_capture_length {
            let delta = output_len.saturating_sub(last);
            self.last_capture_length = Some(output_len);
            return self.increment_assign_score(delta);
        }
        self.render_length = self.render_length.max(output_len);
        if let Some(limit) = self.limits.render_length_limit
            && self.render_length > limit
        {
            self.reached = true;
            return Err(ResourceError::RenderLength {
                limit,
                length: self.render_length,
            });
        }
        Ok(())
    }

    /// Marks the limits as reached and returns the error to raise.
    pub fn raise_limits_reached(&mut self) -> ResourceError {
        self.reached = true;
        ResourceError::LimitsReached
    }

    /// Zeroes all counters and clears the reached flag.
    pub fn reset(&mut self) {
        self.render_score = 0;
        self.assign_score = 0;
        self.render_length = 0;
        self.last_capture_length = None;
        self.reached = false;
    }

    /// Enters capture mode, returning the state to hand back to [`Self::end_capture`].
    pub fn begin_capture(&mut self) -> Option<usize> {
        self.last_capture_length.replace(0)
    }

    pub fn end_capture(&mut self, previous: Option<usize>) {
        self.last_capture_length = previous;
    }

    /// Runs `f` with render length accounting suspended.
    ///
    /// The previous capture state is restored afterwards, so captures nest.
    pub fn with_capture<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let previous = self.begin_capture();
        let result = f(self);
        self.end_capture(previous);
        result
    }
}
