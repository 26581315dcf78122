//! Where candidate codes come from
use super::utils::format_code;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::ops::RangeInclusive;

pub trait CodeSource: Send + Sync {
    /// Draws one candidate code from `range`, rendered as six digits.
    fn draw(&self, range: &RangeInclusive<u32>) -> String;
}

/// Uniform draws from the thread-local generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodeSource;

impl CodeSource for RandomCodeSource {
    fn draw(&self, range: &RangeInclusive<u32>) -> String {
        format_code(rand::thread_rng().gen_range(range.clone()))
    }
}

/// Replays a fixed list of codes, then repeats the last one. The range is
/// ignored so tests can script any six digit value.
#[derive(Debug)]
pub struct SequenceCodeSource {
    codes: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
}

impl SequenceCodeSource {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: Mutex::new(codes.into_iter().map(Into::into).collect()),
            last: Mutex::new(None),
        }
    }
}

impl CodeSource for SequenceCodeSource {
    fn draw(&self, range: &RangeInclusive<u32>) -> String {
        let next = self.codes.lock().pop_front();
        let mut last = self.last.lock();
        match next {
            Some(code) => {
                *last = Some(code.clone());
                code
            }
            None => last
                .clone()
                .unwrap_or_else(|| format_code(*range.start())),
        }
    }
}
