use crate::prelude::{StageError, StageResult};
use serde::{Deserialize, Serialize};

/// Number of physical readout amplifiers. Detector columns are interleaved
/// across them, column `c` being read by amplifier `c % AMPLIFIER_COUNT`.
pub const AMPLIFIER_COUNT: usize = 4;

/// Column → amplifier mapping plus the representative columns sampled when
/// calibrating each amplifier. Several representative columns may feed the
/// same amplifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmplifierPartition {
    pub columns: Vec<usize>,
    pub amplifiers: Vec<usize>,
}

impl Default for AmplifierPartition {
    fn default() -> Self {
        Self {
            columns: vec![34, 35, 36, 37, 38],
            amplifiers: vec![2, 3, 0, 1, 2],
        }
    }
}

impl AmplifierPartition {
    pub fn new(columns: Vec<usize>, amplifiers: Vec<usize>) -> StageResult<Self> {
        let partition = Self {
            columns,
            amplifiers,
        };
        partition.validate()?;
        Ok(partition)
    }

    pub fn validate(&self) -> StageResult<()> {
        if self.columns.len() != self.amplifiers.len() {
            return Err(StageError::InvalidConfig(format!(
                "{} representative columns but {} amplifier assignments",
                self.columns.len(),
                self.amplifiers.len()
            )));
        }
        if let Some(&amp) = self.amplifiers.iter().find(|&&a| a >= AMPLIFIER_COUNT) {
            return Err(StageError::InvalidConfig(format!(
                "amplifier index {} outside 0..{}",
                amp, AMPLIFIER_COUNT
            )));
        }
        Ok(())
    }

    /// Amplifier reading out a detector column.
    pub fn amplifier_of(column: usize) -> usize {
        column % AMPLIFIER_COUNT
    }

    /// `(column, amplifier)` pairs of the representative columns.
    pub fn representatives(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.columns
            .iter()
            .copied()
            .zip(self.amplifiers.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_partition_aliases_amplifier_two() {
        let partition = AmplifierPartition::default();
        let fed_by_two: Vec<usize> = partition
            .representatives()
            .filter(|&(_, amp)| amp == 2)
            .map(|(col, _)| col)
            .collect();
        assert_eq!(fed_by_two, vec![34, 38]);
    }

    #[test]
    fn columns_interleave_over_amplifiers() {
        assert_eq!(AmplifierPartition::amplifier_of(1), 1);
        assert_eq!(AmplifierPartition::amplifier_of(5), 1);
        assert_eq!(AmplifierPartition::amplifier_of(38), 2);
    }

    #[test]
    fn out_of_range_amplifier_rejected() {
        assert!(AmplifierPartition::new(vec![3], vec![4]).is_err());
        assert!(AmplifierPartition::new(vec![3, 4], vec![1]).is_err());
    }
}
