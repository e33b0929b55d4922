use std::ops::RangeInclusive;
use std::time::Duration;

use sigperf::profiler::MAX_CALL_CHAIN_DEPTH;

const CALL_CHAIN_DEPTH_RANGE: RangeInclusive<usize> = 1..=MAX_CALL_CHAIN_DEPTH;

pub(crate) fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

pub(crate) fn interval_is_not_negative(s: &str) -> Result<i64, String> {
    let interval: i64 = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid interval"))?;
    if interval < 0 {
        return Err(format!("interval {} is negative", interval));
    }
    Ok(interval)
}

pub(crate) fn call_chain_depth_in_range(s: &str) -> Result<usize, String> {
    let depth: usize = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid depth"))?;
    if !CALL_CHAIN_DEPTH_RANGE.contains(&depth) {
        return Err(format!(
            "call chain depth not in allowed range {}-{}",
            CALL_CHAIN_DEPTH_RANGE.start(),
            CALL_CHAIN_DEPTH_RANGE.end()
        ));
    }
    Ok(depth)
}

// Convert a &str into a usize, if possible, and return the result if it's a
// power of 2
pub(crate) fn value_is_power_of_two(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid usize"))?;
    if value.is_power_of_two() {
        Ok(value)
    } else {
        Err(format!("{} is not a power of 2", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::distributions::Distribution;
    use rand::distributions::Uniform;
    use rstest::{fixture, rstest};
    use std::collections::HashSet;

    #[fixture]
    fn power_of_two_usize() -> Vec<usize> {
        (0..usize::BITS).map(|shift| 1usize << shift).collect()
    }

    // Random usizes that are NOT powers of 2
    #[fixture]
    fn all_but_power_of_two_usize(power_of_two_usize: Vec<usize>) -> Vec<usize> {
        let powers: HashSet<usize> = power_of_two_usize.into_iter().collect();
        let between = Uniform::from(0..=usize::MAX);
        let mut rng = rand::thread_rng();
        (0..50000)
            .map(|_| between.sample(&mut rng))
            .filter(|value| !powers.contains(value))
            .collect()
    }

    #[rstest]
    fn args_should_be_powers_of_two(power_of_two_usize: Vec<usize>) {
        for value in power_of_two_usize {
            assert_eq!(value_is_power_of_two(&value.to_string()), Ok(value));
        }
    }

    #[rstest]
    fn args_should_not_be_powers_of_two(all_but_power_of_two_usize: Vec<usize>) {
        for value in all_but_power_of_two_usize {
            assert!(value_is_power_of_two(&value.to_string()).is_err());
        }
        assert!(value_is_power_of_two("0").is_err());
        assert!(value_is_power_of_two("four").is_err());
    }

    #[rstest]
    #[case("0", Ok(0))]
    #[case("1000", Ok(1000))]
    #[case("-1", Err("interval -1 is negative".to_string()))]
    #[case("ten", Err("`ten' isn't a valid interval".to_string()))]
    fn test_interval(#[case] arg: &str, #[case] expected: Result<i64, String>) {
        assert_eq!(interval_is_not_negative(arg), expected);
    }

    #[rstest]
    #[case("1", true)]
    #[case("128", true)]
    #[case("0", false)]
    #[case("129", false)]
    #[case("deep", false)]
    fn test_call_chain_depth(#[case] arg: &str, #[case] ok: bool) {
        assert_eq!(call_chain_depth_in_range(arg).is_ok(), ok);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3"), Ok(Duration::from_secs(3)));
        assert!(parse_duration("3s").is_err());
    }
}
