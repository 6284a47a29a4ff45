//! Adam optimizer for the handful of kernel hyperparameters a backend fits.

#[derive(Clone, Debug)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    first_moment: Vec<f64>,
    second_moment: Vec<f64>,
    steps: i32,
}
impl Adam {
    pub fn new(learning_rate: f64, parameters: usize) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            first_moment: vec![0.0; parameters],
            second_moment: vec![0.0; parameters],
            steps: 0,
        }
    }
    /// One descent step on `params` given the gradient of the loss being minimized.
    pub fn step(&mut self, params: &mut [f64], gradient: &[f64]) {
        debug_assert_eq!(params.len(), self.first_moment.len());
        debug_assert_eq!(gradient.len(), self.first_moment.len());
        self.steps += 1;
        let bias1 = 1.0 - self.beta1.powi(self.steps);
        let bias2 = 1.0 - self.beta2.powi(self.steps);
        for (i, p) in params.iter_mut().enumerate() {
            let g = gradient[i];
            self.first_moment[i] = self.beta1 * self.first_moment[i] + (1.0 - self.beta1) * g;
            self.second_moment[i] =
                self.beta2 * self.second_moment[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.first_moment[i] / bias1;
            let v_hat = self.second_moment[i] / bias2;
            *p -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}
