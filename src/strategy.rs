/// The three calling branches of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One joint, ploidy-aware calling pass over fixed-size regions.
    JointOnly,
    /// Per-contig phased calling with haplotype-tagged alignments.
    PhasedDiploid,
    /// Unphased per-contig calling, filtered, then a joint pass seeded by it.
    TwoPassJoint,
}

pub const PHASING_MAX_STRAINS: u32 = 2;

impl Strategy {
    pub fn select(strains: u32, freebayes_only: bool) -> Self {
        if freebayes_only {
            Self::JointOnly
        } else if strains <= PHASING_MAX_STRAINS {
            Self::PhasedDiploid
        } else {
            Self::TwoPassJoint
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::JointOnly => "joint-only",
            Self::PhasedDiploid => "phased-diploid",
            Self::TwoPassJoint => "two-pass-joint",
        }
    }

    pub fn calling_passes(&self) -> u8 {
        match self {
            Self::JointOnly | Self::PhasedDiploid => 1,
            Self::TwoPassJoint => 2,
        }
    }

    pub fn produces_separation(&self) -> bool {
        matches!(self, Self::PhasedDiploid)
    }
}
