use std::sync::Arc;

/// Interleaved 16-bit PCM, shared read-only once created.
pub type Samples = Arc<[i16]>;

/// One entry of a track's buffer list.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackBuffer {
    Decoded {
        track: usize,
        iteration: u64,
        samples: Samples,
    },
    Silence(Samples),
}

impl TrackBuffer {
    pub fn samples(&self) -> &[i16] {
        match self {
            Self::Decoded { samples, .. } | Self::Silence(samples) => samples,
        }
    }

    pub fn shared_samples(&self) -> Samples {
        match self {
            Self::Decoded { samples, .. } | Self::Silence(samples) => samples.clone(),
        }
    }

    pub fn is_silence(&self) -> bool {
        matches!(self, Self::Silence(_))
    }
}

/// Scratch state scoped to a single mix.
///
/// The buffer unit size is learned from the first non-empty decoded buffer
/// and every generated silence buffer has exactly that many samples.
#[derive(Debug, Default)]
pub struct MixContext {
    unit_size: Option<usize>,
    silence: Option<Samples>,
}

impl MixContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit_size(&self) -> Option<usize> {
        self.unit_size
    }

    /// Only the first call has an effect.
    pub fn observe_unit_size(&mut self, samples: usize) {
        if self.unit_size.is_none() && samples > 0 {
            self.unit_size = Some(samples);
        }
    }

    /// The shared all-zero buffer, created on first use. When nothing was
    /// ever decoded the unit size is unknown and `fallback_len` is used.
    pub fn silence_or(&mut self, fallback_len: usize) -> Samples {
        let len = self.unit_size.unwrap_or(fallback_len);
        self.silence
            .get_or_insert_with(|| vec![0i16; len].into())
            .clone()
    }

    pub fn silence(&mut self) -> Samples {
        self.silence_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_size_is_fixed_by_first_observation() {
        let mut ctx = MixContext::new();
        ctx.observe_unit_size(0);
        assert_eq!(ctx.unit_size(), None);

        ctx.observe_unit_size(2048);
        ctx.observe_unit_size(1024);
        assert_eq!(ctx.unit_size(), Some(2048));
    }

    #[test]
    fn silence_is_shared() {
        let mut ctx = MixContext::new();
        ctx.observe_unit_size(4);

        let a = ctx.silence();
        let b = ctx.silence_or(100);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(&*a, &[0, 0, 0, 0]);
    }

    #[test]
    fn silence_without_unit_size_uses_fallback() {
        let mut ctx = MixContext::new();

        assert_eq!(ctx.silence_or(6).len(), 6);
    }
}
