/// Rolling mean over the last `width` samples.
///
/// `init` fills every slot with a seed value so the first few real samples
/// do not swing the average; the window is deliberately small (the renderer
/// uses 3) so the estimate reacts quickly when the scene changes.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: Vec<f64>,
    next: usize,
}

impl MovingAverage {
    pub fn new(width: usize) -> Self {
        assert!(width > 0, "moving average window must not be empty");
        Self {
            samples: vec![0.0; width],
            next: 0,
        }
    }

    pub fn init(&mut self, value: f64) {
        self.samples.fill(value);
        self.next = 0;
    }

    pub fn add(&mut self, value: f64) {
        self.samples[self.next] = value;
        self.next = (self.next + 1) % self.samples.len();
    }

    pub fn average(&self) -> f64 {
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}
