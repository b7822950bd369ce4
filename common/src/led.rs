/// Status LED patterns. Each is a 32-step bitmap played at 100 ms per step,
/// so one cycle lasts 3.2 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    Off,
    On,
    /// Slow blink while joining a network.
    Connecting,
    /// Rapid flash while serving its own access point for setup.
    AwaitSetup,
    /// Two short blips per cycle once joined.
    Connected,
}

pub const LED_STEP_MS: u64 = 100;

impl LedPattern {
    fn bits(self) -> u32 {
        match self {
            Self::Off => 0x0000_0000,
            Self::On => 0xffff_ffff,
            Self::Connecting => 0xffff_0000,
            Self::AwaitSetup => 0xaaaa_aaaa,
            Self::Connected => 0x0001_0001,
        }
    }

    pub fn is_lit(self, now_ms: u64) -> bool {
        let step = (now_ms / LED_STEP_MS) % 32;
        self.bits() & (1 << step) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit_steps(pattern: LedPattern) -> usize {
        (0..32)
            .filter(|step| pattern.is_lit(step * LED_STEP_MS))
            .count()
    }

    #[test]
    fn steady_patterns() {
        assert_eq!(lit_steps(LedPattern::Off), 0);
        assert_eq!(lit_steps(LedPattern::On), 32);
    }

    #[test]
    fn connecting_is_dark_then_lit_for_half_a_cycle() {
        assert!(!LedPattern::Connecting.is_lit(0));
        assert!(!LedPattern::Connecting.is_lit(1_599));
        assert!(LedPattern::Connecting.is_lit(1_600));
        assert!(LedPattern::Connecting.is_lit(3_199));
        assert!(!LedPattern::Connecting.is_lit(3_200));
    }

    #[test]
    fn await_setup_alternates_every_step() {
        assert!(!LedPattern::AwaitSetup.is_lit(0));
        assert!(LedPattern::AwaitSetup.is_lit(100));
        assert!(!LedPattern::AwaitSetup.is_lit(200));
        assert_eq!(lit_steps(LedPattern::AwaitSetup), 16);
    }

    #[test]
    fn connected_blips_twice_per_cycle() {
        assert!(LedPattern::Connected.is_lit(50));
        assert!(LedPattern::Connected.is_lit(1_650));
        assert_eq!(lit_steps(LedPattern::Connected), 2);
    }
}
