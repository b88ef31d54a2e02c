//! Running loss meters and per-epoch progress display.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{Error, Result};

const COLOR_TEMPLATE: &str = "{bar:40.green/black} {pos}/{len} [{elapsed}<{eta}] {msg}";
const PLAIN_TEMPLATE: &str = "{bar:40} {pos}/{len} [{elapsed}<{eta}] {msg}";

/// Sample-weighted running average.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Meter {
    total: f64,
    count: usize,
    last: f64,
}

impl Meter {
    pub fn update(&mut self, value: f64, n: usize) {
        self.total += value * n as f64;
        self.count += n;
        self.last = value;
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }
}

/// Named meters in first-update order.
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    meters: Vec<(String, Meter)>,
    color: bool,
}

impl MetricLogger {
    pub fn new(color: bool) -> Self {
        Self {
            meters: Vec::new(),
            color,
        }
    }

    pub fn reset(&mut self) {
        self.meters.clear();
    }

    /// Record `value` averaged over `n` samples.
    pub fn update(&mut self, name: &str, value: f64, n: usize) {
        match self.meters.iter_mut().find(|(k, _)| k == name) {
            Some((_, meter)) => meter.update(value, n),
            None => {
                let mut meter = Meter::default();
                meter.update(value, n);
                self.meters.push((name.to_string(), meter));
            }
        }
    }

    pub fn meter(&self, name: &str) -> Option<&Meter> {
        self.meters.iter().find(|(k, _)| k == name).map(|(_, m)| m)
    }

    pub fn names(&self) -> Vec<&str> {
        self.meters.iter().map(|(k, _)| k.as_str()).collect()
    }

    /// `name: last (avg)` for every meter, for the progress bar.
    pub fn status(&self) -> String {
        self.meters
            .iter()
            .map(|(k, m)| format!("{k}: {:.4} ({:.4})", m.last(), m.global_avg()))
            .collect::<Vec<_>>()
            .join("  ")
    }

    /// `name: avg` for every meter.
    pub fn summary(&self) -> String {
        self.meters
            .iter()
            .map(|(k, m)| format!("{k}: {:.4}", m.global_avg()))
            .collect::<Vec<_>>()
            .join("  ")
    }

    /// `Epoch: i/E` with 1-based `i`.
    pub fn header(&self, epoch: usize, epochs: usize) -> String {
        let text = format!("Epoch: {}/{}", epoch + 1, epochs);
        if self.color {
            style(text).blue().force_styling(true).to_string()
        } else {
            text
        }
    }

    pub fn progress_bar(&self, len: usize) -> Result<ProgressBar> {
        let template = if self.color { COLOR_TEMPLATE } else { PLAIN_TEMPLATE };
        let style = ProgressStyle::default_bar()
            .template(template)
            .map_err(|e| Error::Config(format!("progress template: {e}")))?;
        let pb = ProgressBar::new(len as u64);
        pb.set_style(style);
        Ok(pb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_weight_by_sample_count() {
        let mut logger = MetricLogger::new(false);
        logger.update("loss", 2.0, 3);
        logger.update("mse_loss", 0.5, 3);
        logger.update("loss", 4.0, 1);
        let loss = logger.meter("loss").unwrap();
        assert!((loss.global_avg() - 2.5).abs() < 1e-12);
        assert_eq!(loss.last(), 4.0);
        assert_eq!(logger.names(), vec!["loss", "mse_loss"]);
        assert_eq!(logger.summary(), "loss: 2.5000  mse_loss: 0.5000");

        logger.reset();
        assert!(logger.names().is_empty());
        assert!(logger.meter("loss").is_none());
    }

    #[test]
    fn header_is_one_based() {
        assert_eq!(MetricLogger::new(false).header(0, 10), "Epoch: 1/10");
        let colored = MetricLogger::new(true).header(9, 10);
        assert!(colored.starts_with("\x1b[34m"));
        assert!(colored.contains("Epoch: 10/10"));
    }

    #[test]
    fn templates_parse() {
        MetricLogger::new(true).progress_bar(3).unwrap();
        MetricLogger::new(false).progress_bar(3).unwrap();
    }
}
