//! Kernel CPU list parsing (`0-3,8-11` style)

/// Parse a kernel CPU list such as `0-3,8,10-11`.
///
/// Malformed fragments are skipped. The result is sorted and deduplicated.
pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();

    for part in list.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.trim().parse::<usize>(), end.trim().parse::<usize>()) {
                    if start <= end {
                        cpus.extend(start..=end);
                    }
                }
            }
            None => {
                if let Ok(cpu) = part.parse() {
                    cpus.push(cpu);
                }
            }
        }
    }

    cpus.sort_unstable();
    cpus.dedup();
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_and_singles() {
        assert_eq!(parse_cpu_list("0-3,8-11"), vec![0, 1, 2, 3, 8, 9, 10, 11]);
        assert_eq!(parse_cpu_list("5"), vec![5]);
        assert_eq!(parse_cpu_list("2,0-1\n"), vec![0, 1, 2]);
    }

    #[test]
    fn test_malformed_fragments_skipped() {
        assert_eq!(parse_cpu_list("a-3,4,7-5,,6"), vec![4, 6]);
        assert!(parse_cpu_list("").is_empty());
    }
}
