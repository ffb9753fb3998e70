//! Host CPU feature probe

use std::fmt;

/// Instruction set extensions the loader cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuFeatures {
    pub sse: bool,
    pub sse2: bool,
    pub sse3: bool,
    pub ssse3: bool,
    pub sse4_1: bool,
    pub sse4_2: bool,
    pub aes: bool,
    pub avx: bool,
    pub pclmulqdq: bool,
    pub f16c: bool,
    pub bmi1: bool,
}

impl CpuFeatures {
    /// Probe the running processor.
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        Self {
            sse: is_x86_feature_detected!("sse"),
            sse2: is_x86_feature_detected!("sse2"),
            sse3: is_x86_feature_detected!("sse3"),
            ssse3: is_x86_feature_detected!("ssse3"),
            sse4_1: is_x86_feature_detected!("sse4.1"),
            sse4_2: is_x86_feature_detected!("sse4.2"),
            aes: is_x86_feature_detected!("aes"),
            avx: is_x86_feature_detected!("avx"),
            pclmulqdq: is_x86_feature_detected!("pclmulqdq"),
            f16c: is_x86_feature_detected!("f16c"),
            bmi1: is_x86_feature_detected!("bmi1"),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Self {
        Self::default()
    }

    /// Names of the features guest code assumes but the host lacks.
    ///
    /// BMI1 is not listed; it is emulated on illegal-instruction traps.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let checks = [
            (self.sse, "SSE"),
            (self.sse2, "SSE2"),
            (self.sse3, "SSE3"),
            (self.ssse3, "SSSE3"),
            (self.sse4_1, "SSE4.1"),
            (self.sse4_2, "SSE4.2"),
            (self.aes, "AES-NI"),
            (self.avx, "AVX"),
            (self.pclmulqdq, "CLMUL"),
            (self.f16c, "F16C"),
        ];
        checks
            .iter()
            .filter(|(present, _)| !present)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for CpuFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let missing = self.missing_required();
        if missing.is_empty() {
            write!(f, "all required features present")?;
        } else {
            write!(f, "missing {}", missing.join(", "))?;
        }
        if !self.bmi1 {
            write!(f, " (BMI1 emulated)")?;
        }
        Ok(())
    }
}
