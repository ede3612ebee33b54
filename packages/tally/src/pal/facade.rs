use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::pal::abstractions::Platform;
#[cfg(test)]
use crate::pal::fake::FakePlatform;
use crate::pal::real::RealPlatform;

/// Switches between the real platform and the fake one used in tests.
#[derive(Clone, Debug)]
pub(crate) enum PlatformFacade {
    Real(RealPlatform),

    #[cfg(test)]
    Fake(FakePlatform),
}

impl PlatformFacade {
    pub(crate) const fn real() -> Self {
        Self::Real(RealPlatform)
    }

    #[cfg(test)]
    pub(crate) fn fake(platform: FakePlatform) -> Self {
        Self::Fake(platform)
    }
}

impl Default for PlatformFacade {
    fn default() -> Self {
        Self::real()
    }
}

impl Platform for PlatformFacade {
    fn now(&self) -> Instant {
        match self {
            Self::Real(platform) => platform.now(),
            #[cfg(test)]
            Self::Fake(platform) => platform.now(),
        }
    }

    fn local_now(&self) -> DateTime<Local> {
        match self {
            Self::Real(platform) => platform.local_now(),
            #[cfg(test)]
            Self::Fake(platform) => platform.local_now(),
        }
    }

    fn thread_processor_time(&self) -> Option<Duration> {
        match self {
            Self::Real(platform) => platform.thread_processor_time(),
            #[cfg(test)]
            Self::Fake(platform) => platform.thread_processor_time(),
        }
    }

    fn process_processor_time(&self) -> Option<Duration> {
        match self {
            Self::Real(platform) => platform.process_processor_time(),
            #[cfg(test)]
            Self::Fake(platform) => platform.process_processor_time(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn fake_is_forwarded() {
        let fake = FakePlatform::new();
        let facade = PlatformFacade::fake(fake.clone());

        let start = facade.now();
        fake.advance(Duration::from_millis(250));

        assert_eq!(facade.now().duration_since(start), Duration::from_millis(250));
        assert_eq!(facade.local_now(), fake.local_now());
    }

    #[test]
    fn default_is_real() {
        assert!(matches!(PlatformFacade::default(), PlatformFacade::Real(_)));
    }
}
