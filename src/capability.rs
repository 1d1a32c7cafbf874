//! Per-device capability state.
//!
//! Every query family starts [`Capability::Undetermined`]. The first success
//! makes it [`Capability::Supported`], the first "not supported" on an
//! undetermined family makes it [`Capability::Unsupported`]. Both are final:
//! an unsupported family is never queried again, a supported one is never
//! downgraded (a later "not supported" is handled like a transient error).
//!
//! Families that fan out over a fixed enumeration (clock domains, violation
//! policies) track one bit per member in a [`CapabilityMask`].

use crate::query::Outcome;

/// Tri-state support flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capability {
    /// Not queried successfully or unsuccessfully yet.
    #[default]
    Undetermined,
    /// At least one query succeeded.
    Supported,
    /// The driver reported the query as not supported.
    Unsupported,
}

impl Capability {
    /// Whether the family may be queried.
    #[inline]
    #[must_use]
    pub fn should_query(self) -> bool {
        self != Self::Unsupported
    }

    /// Applies a query outcome. Returns true if this call made the flag
    /// unsupported.
    pub fn record(&mut self, outcome: Outcome) -> bool {
        match (*self, outcome) {
            (Self::Undetermined, Outcome::Success) => {
                *self = Self::Supported;
                false
            }
            (Self::Undetermined, Outcome::Unavailable) => {
                *self = Self::Unsupported;
                true
            }
            _ => false,
        }
    }
}

/// One sticky [`Capability`] per member of a small enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityMask {
    width: u8,
    supported: u32,
    unsupported: u32,
}

impl CapabilityMask {
    /// Creates an undetermined mask with `width` members (at most 32).
    #[must_use]
    pub const fn new(width: u8) -> Self {
        let width = if width > 32 { 32 } else { width };
        Self { width, supported: 0, unsupported: 0 }
    }

    fn full(&self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    /// State of member `bit`. Bits outside the mask are never queryable.
    #[must_use]
    pub fn get(&self, bit: usize) -> Capability {
        if bit >= usize::from(self.width) {
            return Capability::Unsupported;
        }
        let m = 1u32 << bit;
        if self.unsupported & m != 0 {
            Capability::Unsupported
        } else if self.supported & m != 0 {
            Capability::Supported
        } else {
            Capability::Undetermined
        }
    }

    /// Whether member `bit` may be queried.
    #[must_use]
    pub fn should_query_bit(&self, bit: usize) -> bool {
        self.get(bit).should_query()
    }

    /// Whether any member may still be queried.
    #[must_use]
    pub fn should_query(&self) -> bool {
        self.unsupported != self.full()
    }

    /// Family level view: unsupported only once every member is.
    #[must_use]
    pub fn state(&self) -> Capability {
        if !self.should_query() {
            Capability::Unsupported
        } else if self.supported != 0 {
            Capability::Supported
        } else {
            Capability::Undetermined
        }
    }

    /// Applies the outcome for member `bit`. Returns true if this call made
    /// the whole family unsupported.
    pub fn record(&mut self, bit: usize, outcome: Outcome) -> bool {
        if bit >= usize::from(self.width) {
            return false;
        }
        let was_queryable = self.should_query();
        let mut flag = self.get(bit);
        flag.record(outcome);
        let m = 1u32 << bit;
        match flag {
            Capability::Supported => self.supported |= m,
            Capability::Unsupported => self.unsupported |= m,
            Capability::Undetermined => {}
        }
        was_queryable && !self.should_query()
    }
}

// ============================================================================
// Query families
// ============================================================================

macro_rules! families {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Query families with their own capability flag.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Family {
            $(
                #[doc = $name]
                $variant,
            )+
        }

        impl Family {
            /// All families.
            pub const ALL: &'static [Family] = &[$(Self::$variant),+];

            /// Number of families.
            pub const COUNT: usize = Self::ALL.len();

            /// Name used in log messages.
            #[must_use]
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }
    };
}

families! {
    ClockThrottle => "clock throttle reasons",
    Bar1Memory => "BAR1 memory",
    Temperature => "temperature",
    MemoryTemperature => "memory temperature",
    Energy => "energy consumption",
    PerfState => "performance state",
    PowerUsage => "power usage",
    PowerEnforcedLimit => "enforced power limit",
    PowerManagementLimit => "power management limit",
    Fan => "fan speed",
    Utilization => "utilization",
    EncoderUtilization => "encoder utilization",
    DecoderUtilization => "decoder utilization",
    PcieTx => "PCIe tx throughput",
    PcieRx => "PCIe rx throughput",
    PcieReplay => "PCIe replay counter",
    Memory => "memory",
    EccMode => "ECC mode",
    EccErrors => "ECC error counters",
    RetiredPagesSbe => "retired pages (sbe)",
    RetiredPagesDbe => "retired pages (dbe)",
    RetiredPagesPending => "retired pages pending",
    RemappedRows => "remapped rows",
    NvLinkErrors => "NVLink errors",
    NvLinkTraffic => "NVLink traffic",
    EncoderStats => "encoder stats",
    EncoderSessions => "encoder sessions",
    FbcStats => "frame capture stats",
    FbcSessions => "frame capture sessions",
}

impl Family {
    fn index(self) -> usize {
        self as usize
    }
}

/// Capability flags of one device.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    flags: [Capability; Family::COUNT],
    /// Current clock per [`ClockDomain`](crate::query::ClockDomain).
    pub clock_now: CapabilityMask,
    /// Applications clock per [`ClockDomain`](crate::query::ClockDomain).
    pub clock_set: CapabilityMask,
    /// Violation time per [`PerfPolicy`](crate::query::PerfPolicy).
    pub violations: CapabilityMask,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            flags: [Capability::Undetermined; Family::COUNT],
            clock_now: CapabilityMask::new(4),
            clock_set: CapabilityMask::new(4),
            violations: CapabilityMask::new(8),
        }
    }
}

/// Families tracked per member in a [`CapabilityMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskFamily {
    /// Current clock, one bit per clock domain.
    ClockNow,
    /// Applications clock, one bit per clock domain.
    ClockSet,
    /// Violation time, one bit per performance policy.
    Violations,
}

impl MaskFamily {
    /// Name used in log messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ClockNow => "current clock",
            Self::ClockSet => "applications clock",
            Self::Violations => "violation time",
        }
    }
}

impl CapabilitySet {
    /// The mask of `family`.
    #[must_use]
    pub fn mask(&self, family: MaskFamily) -> &CapabilityMask {
        match family {
            MaskFamily::ClockNow => &self.clock_now,
            MaskFamily::ClockSet => &self.clock_set,
            MaskFamily::Violations => &self.violations,
        }
    }

    /// Mutable access to the mask of `family`.
    pub fn mask_mut(&mut self, family: MaskFamily) -> &mut CapabilityMask {
        match family {
            MaskFamily::ClockNow => &mut self.clock_now,
            MaskFamily::ClockSet => &mut self.clock_set,
            MaskFamily::Violations => &mut self.violations,
        }
    }

    /// State of `family`.
    #[must_use]
    pub fn get(&self, family: Family) -> Capability {
        self.flags[family.index()]
    }

    /// Whether `family` may be queried.
    #[inline]
    #[must_use]
    pub fn should_query(&self, family: Family) -> bool {
        self.get(family).should_query()
    }

    /// Applies a query outcome to `family`. Returns true if the family just
    /// became unsupported.
    pub fn record(&mut self, family: Family, outcome: Outcome) -> bool {
        self.flags[family.index()].record(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_starts_undetermined() {
        let cap = Capability::default();
        assert_eq!(cap, Capability::Undetermined);
        assert!(cap.should_query());
    }

    #[test]
    fn test_success_is_sticky() {
        let mut cap = Capability::default();
        assert!(!cap.record(Outcome::Success));
        assert_eq!(cap, Capability::Supported);

        assert!(!cap.record(Outcome::Unavailable), "supported must not be downgraded");
        assert_eq!(cap, Capability::Supported);
        assert!(cap.should_query());
    }

    #[test]
    fn test_unavailable_is_sticky() {
        let mut cap = Capability::default();
        assert!(cap.record(Outcome::Unavailable));
        assert_eq!(cap, Capability::Unsupported);
        assert!(!cap.should_query());

        cap.record(Outcome::Success);
        assert_eq!(cap, Capability::Unsupported);
    }

    #[test]
    fn test_transient_leaves_state() {
        let mut cap = Capability::default();
        cap.record(Outcome::Transient);
        assert_eq!(cap, Capability::Undetermined);
    }

    #[test]
    fn test_mask_unsupported_only_when_all_bits() {
        let mut mask = CapabilityMask::new(3);
        assert!(!mask.record(0, Outcome::Unavailable));
        assert!(!mask.record(1, Outcome::Unavailable));
        assert!(mask.should_query());
        assert!(!mask.should_query_bit(0));
        assert!(mask.should_query_bit(2));

        assert!(mask.record(2, Outcome::Unavailable));
        assert!(!mask.should_query());
        assert_eq!(mask.state(), Capability::Unsupported);
    }

    #[test]
    fn test_mask_supported_bit_blocks_family_disable() {
        let mut mask = CapabilityMask::new(2);
        mask.record(0, Outcome::Success);
        mask.record(1, Outcome::Unavailable);
        mask.record(0, Outcome::Unavailable);

        assert_eq!(mask.get(0), Capability::Supported);
        assert_eq!(mask.state(), Capability::Supported);
        assert!(mask.should_query());
    }

    #[test]
    fn test_mask_ignores_out_of_range_bit() {
        let mut mask = CapabilityMask::new(2);
        assert!(!mask.record(5, Outcome::Unavailable));
        assert_eq!(mask.state(), Capability::Undetermined);
    }

    #[test]
    fn test_mask_get_out_of_range_bit() {
        let mut mask = CapabilityMask::new(32);
        mask.record(31, Outcome::Success);
        assert_eq!(mask.get(31), Capability::Supported);
        assert_eq!(mask.get(32), Capability::Unsupported);
        assert_eq!(mask.get(usize::MAX), Capability::Unsupported);
        assert!(!CapabilityMask::new(3).should_query_bit(3));
    }

    #[test]
    fn test_set_tracks_families_independently() {
        let mut set = CapabilitySet::default();
        assert!(set.record(Family::Fan, Outcome::Unavailable));
        set.record(Family::Memory, Outcome::Success);

        assert!(!set.should_query(Family::Fan));
        assert!(set.should_query(Family::Memory));
        assert_eq!(set.get(Family::EccMode), Capability::Undetermined);
    }

    #[test]
    fn test_set_masks_have_member_width() {
        let mut set = CapabilitySet::default();
        for bit in 0..4 {
            set.mask_mut(MaskFamily::ClockNow).record(bit, Outcome::Unavailable);
        }
        assert!(!set.mask(MaskFamily::ClockNow).should_query());

        for bit in 0..7 {
            set.mask_mut(MaskFamily::Violations).record(bit, Outcome::Unavailable);
        }
        assert!(set.mask(MaskFamily::Violations).should_query(), "one policy left");
        assert!(set.mask(MaskFamily::ClockSet).should_query());
    }

    #[test]
    fn test_family_names_unique() {
        let mut names: Vec<_> = Family::ALL.iter().map(|f| f.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Family::COUNT);
    }
}
