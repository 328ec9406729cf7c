//! Types for configuring the runtime parameters of the containers.
//!
//! The reservation-table size and the retire-scan cadence are build-time
//! constants (see `build.rs`); everything else is carried per container
//! instance by a [`Config`].

/// Queue segments hold `2^segment_size_log` cells.
const DEFAULT_SEGMENT_SIZE_LOG: u32 = 12;
const SEGMENT_SIZE_LOG_MIN: u32 = 2;
const SEGMENT_SIZE_LOG_MAX: u32 = 25;

/// Enqueue step width at which a starving enqueuer requests help.
const DEFAULT_HELP_THRESHOLD: u64 = 32;

/// Bucket usage (percent of capacity) that triggers a store migration.
const DEFAULT_MIG_LOAD_PCT: u64 = 75;
/// Live fraction (percent of capacity) below which a migration keeps the
/// current capacity instead of doubling it.
const DEFAULT_MIG_GROW_PCT: u64 = 25;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Runtime configuration parameters.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    segment_size_log: u32,
    help_threshold: u64,
    mig_load_pct: u64,
    mig_grow_pct: u64,
}

/********** impl Default **************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/********** impl inherent *************************************************************************/

impl Config {
    /// Creates a new [`Config`] with the given parameters.
    ///
    /// # Panics
    ///
    /// This function panics if `segment_size_log` is outside of `[2, 25]`,
    /// if `help_threshold` is smaller than 2, or if the migration
    /// percentages are not `0 < mig_grow_pct < mig_load_pct <= 100`.
    #[inline]
    pub fn with_params(
        segment_size_log: u32,
        help_threshold: u64,
        mig_load_pct: u64,
        mig_grow_pct: u64,
    ) -> Self {
        assert!(
            (SEGMENT_SIZE_LOG_MIN..=SEGMENT_SIZE_LOG_MAX).contains(&segment_size_log),
            "segment size log must be in [{}, {}]",
            SEGMENT_SIZE_LOG_MIN,
            SEGMENT_SIZE_LOG_MAX
        );
        assert!(help_threshold >= 2, "help threshold must be at least 2");
        assert!(
            mig_load_pct > 0 && mig_load_pct <= 100,
            "migration load percentage must be in (0, 100]"
        );
        assert!(
            mig_grow_pct < mig_load_pct,
            "migration grow percentage must be below the load percentage"
        );

        Self { segment_size_log, help_threshold, mig_load_pct, mig_grow_pct }
    }

    /// Returns the log2 of the default queue segment cell count.
    #[inline]
    pub fn segment_size_log(&self) -> u32 {
        self.segment_size_log
    }

    /// Returns the enqueue step width at which help is requested.
    #[inline]
    pub fn help_threshold(&self) -> u64 {
        self.help_threshold
    }

    /// Returns the bucket usage percentage that triggers a migration.
    #[inline]
    pub fn mig_load_pct(&self) -> u64 {
        self.mig_load_pct
    }

    /// Returns the live percentage below which a migration keeps the
    /// current capacity.
    #[inline]
    pub fn mig_grow_pct(&self) -> u64 {
        self.mig_grow_pct
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for gradually initializing a [`Config`].
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigBuilder {
    segment_size_log: Option<u32>,
    help_threshold: Option<u64>,
    mig_load_pct: Option<u64>,
    mig_grow_pct: Option<u64>,
}

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`] with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the log2 of the default queue segment cell count.
    #[inline]
    pub fn segment_size_log(mut self, segment_size_log: u32) -> Self {
        self.segment_size_log = Some(segment_size_log);
        self
    }

    /// Sets the enqueue step width at which a starving enqueuer announces
    /// that it requires a grown successor segment.
    #[inline]
    pub fn help_threshold(mut self, help_threshold: u64) -> Self {
        self.help_threshold = Some(help_threshold);
        self
    }

    /// Sets the bucket usage percentage that triggers a store migration.
    #[inline]
    pub fn mig_load_pct(mut self, mig_load_pct: u64) -> Self {
        self.mig_load_pct = Some(mig_load_pct);
        self
    }

    /// Sets the live percentage below which a migration does not grow.
    #[inline]
    pub fn mig_grow_pct(mut self, mig_grow_pct: u64) -> Self {
        self.mig_grow_pct = Some(mig_grow_pct);
        self
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`].
    ///
    /// Unspecified parameters are initialized with their default values.
    #[inline]
    pub fn build(self) -> Config {
        Config::with_params(
            self.segment_size_log.unwrap_or(DEFAULT_SEGMENT_SIZE_LOG),
            self.help_threshold.unwrap_or(DEFAULT_HELP_THRESHOLD),
            self.mig_load_pct.unwrap_or(DEFAULT_MIG_LOAD_PCT),
            self.mig_grow_pct.unwrap_or(DEFAULT_MIG_GROW_PCT),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigBuilder};

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.segment_size_log(), 12);
        assert_eq!(config.help_threshold(), 32);
        assert_eq!(config.mig_load_pct(), 75);
        assert_eq!(config.mig_grow_pct(), 25);
    }

    #[test]
    fn builder() {
        let config = ConfigBuilder::new()
            .segment_size_log(4)
            .help_threshold(8)
            .build();
        assert_eq!(config.segment_size_log(), 4);
        assert_eq!(config.help_threshold(), 8);
        assert_eq!(config.mig_load_pct(), 75);
    }

    #[test]
    #[should_panic]
    fn segment_size_log_out_of_range() {
        let _ = ConfigBuilder::new().segment_size_log(30).build();
    }

    #[test]
    #[should_panic]
    fn grow_pct_above_load_pct() {
        let _ = ConfigBuilder::new().mig_load_pct(50).mig_grow_pct(60).build();
    }
}
