use clap::Parser;
use swiss_set::HashSet;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'c', long = "target_capacity", default_value_t = 1000)]
    target_capacity: usize,

    /// Percentage of the inserted values to remove again before reporting.
    #[arg(short = 'r', long = "remove_percent", default_value_t = 0)]
    remove_percent: u8,

    /// Seed for the set's internal random source.
    #[arg(short = 's', long = "seed")]
    seed: Option<u64>,
}

fn main() {
    let args = Args::parse();

    println!(
        "Creating HashSet with target capacity: {}",
        args.target_capacity
    );

    let mut set: HashSet<u64> = match args.seed {
        Some(seed) => {
            HashSet::with_capacity_hasher_and_seed(args.target_capacity, Default::default(), seed)
        }
        None => HashSet::with_capacity(args.target_capacity),
    };

    let num_values = set.capacity() as u64;
    println!("Actual capacity: {}", num_values);
    println!("Filling set with u64 values...");

    for value in 0..num_values {
        assert!(set.insert(value), "Value already exists in set: {}", value);
    }

    let to_remove = num_values * args.remove_percent.min(100) as u64 / 100;
    for value in 0..to_remove {
        assert!(set.remove(&value), "Value missing from set: {}", value);
    }

    println!(
        "Inserted {} values, removed {}, {} remain",
        num_values,
        to_remove,
        set.len()
    );
    println!("Remaining capacity before growth: {}", set.capacity());

    set.probe_histogram().print();
    set.debug_stats().print();

    let histogram = set.probe_histogram();
    println!(
        "Probe distance: max {} groups, mean {:.3} groups",
        histogram.max_distance(),
        histogram.mean_distance()
    );
}
