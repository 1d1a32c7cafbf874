//! Static attribute cache.
//!
//! Values fused into the device (thresholds, rated limits, link capabilities)
//! are queried on the first scrape that needs them, formatted once and kept
//! for the life of the session.

/// Families whose samples never change while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaticFamily {
    /// Name, bus id and UUID.
    DeviceInfo,
    /// Default, max and min graphics clock.
    ClocksGraphics,
    /// Default, max and min SM clock.
    ClocksSm,
    /// Default, max and min memory clock.
    ClocksMem,
    /// Default, max and min video clock.
    ClocksVideo,
    /// Temperature thresholds.
    TemperatureThresholds,
    /// Default, min and max power limit.
    PowerLimits,
    /// Current and maximum PCIe generation and width.
    PcieLink,
    /// Number of NVLinks.
    NvLinkCount,
    /// Common NVLink bandwidth.
    NvLinkBandwidth,
}

impl StaticFamily {
    /// Number of families.
    pub const COUNT: usize = 10;

    fn index(self) -> usize {
        self as usize
    }
}

/// A formatted, ready to emit set of sample lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticFragment {
    /// Sample lines; empty if no attribute could be obtained.
    pub text: String,
    /// How many attributes were obtained.
    pub supported: u32,
}

impl StaticFragment {
    /// Whether at least one attribute was obtained.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.supported > 0
    }
}

/// Per-device fragments, indexed by [`StaticFamily`].
#[derive(Debug, Clone, Default)]
pub struct StaticCache {
    slots: [Option<StaticFragment>; StaticFamily::COUNT],
}

impl StaticCache {
    /// Returns the fragment of `family`, computing it with `init` on first use.
    ///
    /// `init` runs at most once per family for the life of the cache.
    pub fn get_or_init(
        &mut self,
        family: StaticFamily,
        init: impl FnOnce() -> StaticFragment,
    ) -> &StaticFragment {
        self.slots[family.index()].get_or_insert_with(init)
    }

    /// The fragment of `family`, if already computed.
    #[must_use]
    pub fn get(&self, family: StaticFamily) -> Option<&StaticFragment> {
        self.slots[family.index()].as_ref()
    }

    /// Drops every fragment. Only used at teardown.
    pub fn clear(&mut self) {
        self.slots = Default::default();
    }
}
