//! Occupancy diagnostics for [`HashTable`](crate::hash_table::HashTable).
//!
//! Available with the `stats` feature. Printing requires `std`.

use alloc::vec::Vec;

/// Snapshot of a table's counters and memory use.
#[derive(Debug, Clone)]
pub struct DebugStats {
    /// Number of keys in the table
    pub len: usize,
    /// Lanes that are not `EMPTY` (keys plus tombstones)
    pub resident: usize,
    /// Tombstoned lanes
    pub dead: usize,
    /// Number of groups allocated
    pub group_count: usize,
    /// Resident lanes allowed before the next rehash
    pub element_limit: usize,
    /// Total number of lanes allocated
    pub total_slots: usize,
    /// Resident lanes over total lanes
    pub load_factor: f64,
    /// Total memory in bytes used by the groups
    pub total_bytes: usize,
}

impl DebugStats {
    /// Pretty-print the debug statistics.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        println!("=== Swiss Set Debug Statistics ===");
        println!(
            "Population: {} keys, {} tombstones, limit {}",
            self.len, self.dead, self.element_limit
        );
        println!(
            "Lane Usage: {}/{} ({:.2}% load factor)",
            self.resident,
            self.total_slots,
            self.load_factor * 100.0
        );
        println!("Groups: {}", self.group_count);
        println!("Total Allocated: {} bytes", self.total_bytes);
    }
}

/// Keys counted by probe distance, in groups, from their home group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeHistogram {
    /// `bins[d]` is the number of keys stored `d` groups past their home
    /// group. Trailing empty bins are trimmed.
    pub bins: Vec<usize>,
}

impl ProbeHistogram {
    /// Largest probe distance of any key.
    pub fn max_distance(&self) -> usize {
        self.bins.iter().rposition(|&c| c > 0).unwrap_or(0)
    }

    /// Mean probe distance over all keys.
    pub fn mean_distance(&self) -> f64 {
        let total: usize = self.bins.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let weighted: usize = self.bins.iter().enumerate().map(|(d, &c)| d * c).sum();
        weighted as f64 / total as f64
    }

    /// Pretty-prints the histogram as a horizontal bar chart.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        let max = self.bins.iter().copied().max().unwrap_or(0);
        if max == 0 {
            println!("probe histogram: empty");
            return;
        }

        let max_bar = 60usize;
        let total_units = max_bar * 8;
        println!(
            "probe histogram ({} keys):",
            self.bins.iter().sum::<usize>()
        );

        let make_bar = |count: usize| -> alloc::string::String {
            if count == 0 {
                return alloc::string::String::new();
            }
            let units = ((count as u128 * total_units as u128).div_ceil(max as u128)) as usize;
            let mut bar = "█".repeat(units / 8);
            let partial = ['▏', '▎', '▍', '▌', '▋', '▊', '▉'];
            if units % 8 > 0 {
                bar.push(partial[units % 8 - 1]);
            }
            bar
        };

        for (distance, &count) in self.bins.iter().enumerate() {
            println!("{:>3} | {} ({})", distance, make_bar(count), count);
        }
    }
}
