use crate::config::HostConfig;
use crate::state::{ServerMetrics, UPTIME_UNKNOWN};
use thiserror::Error;

const BYTES_PER_GIB: f64 = (1_u64 << 30) as f64;
const MIN_SEGMENTS: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected at least 3 output lines, got {found}")]
    TooFewSegments { found: usize },
}

/// Too few lines is the only hard failure; the caller substitutes the
/// offline record. Bad numbers inside a line read as zero.
pub fn parse_output(stdout: &str, host: &HostConfig) -> Result<ServerMetrics, ParseError> {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.len() < MIN_SEGMENTS {
        return Err(ParseError::TooFewSegments { found: lines.len() });
    }

    let cpu = parse_f64_loose(lines[0]).unwrap_or(0.0);

    let mut ram = lines[1].split_whitespace();
    let ram_total = bytes_to_gib(ram.next());
    let ram_used = bytes_to_gib(ram.next());
    let ram_percent = if ram_total > 0.0 {
        round1(ram_used / ram_total * 100.0)
    } else {
        0.0
    };

    let mut disk = lines[2].split_whitespace();
    let disk_total = bytes_to_gib(disk.next());
    let disk_used = bytes_to_gib(disk.next());
    // df's own percentage, not recomputed from the byte counts.
    let disk_percent = disk.next().map(parse_percent).unwrap_or(0);

    let uptime = lines
        .get(3)
        .map(|l| strip_up_prefix(l))
        .filter(|u| !u.is_empty())
        .unwrap_or(UPTIME_UNKNOWN)
        .to_string();

    Ok(ServerMetrics {
        id: host.id.clone(),
        name: host.name.clone(),
        ip: host.address.clone(),
        role: host.role.clone(),
        icon: host.icon.clone(),
        online: true,
        cpu: round1(cpu),
        ram_percent,
        ram_used,
        ram_total,
        disk_percent,
        disk_used,
        disk_total,
        uptime,
    })
}

fn bytes_to_gib(field: Option<&str>) -> f64 {
    let bytes = field.and_then(parse_u64_loose).unwrap_or(0);
    round1(bytes as f64 / BYTES_PER_GIB)
}

fn parse_percent(field: &str) -> u32 {
    parse_f64_loose(field.trim_end_matches('%'))
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v.trunc() as u32)
        .unwrap_or(0)
}

fn strip_up_prefix(line: &str) -> &str {
    let trimmed = line.trim();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    match (parts.next(), parts.next()) {
        (Some(word), Some(rest)) if word.eq_ignore_ascii_case("up") => rest.trim(),
        _ => trimmed,
    }
}

fn round1(v: f64) -> f64 {
    if !v.is_finite() {
        return 0.0;
    }
    (v * 10.0).round() / 10.0
}

fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return Some(v);
    }

    // Keep the leading numeric run only, e.g. "3.1us," -> 3.1
    let leading: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+'))
        .collect();
    if leading.is_empty() {
        return None;
    }

    leading.replace(',', ".").parse::<f64>().ok()
}

// Leading digit run only: "inf" or "1e10" must not read as a byte count.
fn parse_u64_loose(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_host;

    fn parse_metrics_output(stdout: &str, host: &HostConfig) -> ServerMetrics {
        parse_output(stdout, host).unwrap_or_else(|_| ServerMetrics::offline(host))
    }

    const FULL_OUTPUT: &str = "12.34\n8589934592 4294967296\n107374182400 53687091200 50%\nup 3 days, 4 hours\n";

    #[test]
    fn parses_complete_output() {
        let host = test_host("aiko", "192.168.0.176");
        let m = parse_metrics_output(FULL_OUTPUT, &host);
        assert!(m.online);
        assert_eq!(m.id, "aiko");
        assert_eq!(m.ip, "192.168.0.176");
        assert_eq!(m.cpu, 12.3);
        assert_eq!(m.ram_total, 8.0);
        assert_eq!(m.ram_used, 4.0);
        assert_eq!(m.ram_percent, 50.0);
        assert_eq!(m.disk_total, 100.0);
        assert_eq!(m.disk_used, 50.0);
        assert_eq!(m.disk_percent, 50);
        assert_eq!(m.uptime, "3 days, 4 hours");
    }

    #[test]
    fn two_segments_degrade_to_offline_record() {
        let host = test_host("proxy", "10.0.0.2");
        let out = "5.0\n8589934592 4294967296\n";
        assert_eq!(
            parse_output(out, &host),
            Err(ParseError::TooFewSegments { found: 2 })
        );
        let m = parse_metrics_output(out, &host);
        assert!(m.is_offline_record());
        assert_eq!(m.id, "proxy");
    }

    #[test]
    fn blank_lines_do_not_count_as_segments() {
        let host = test_host("proxy", "10.0.0.2");
        let m = parse_metrics_output("\n  \n5.0\n\n1 1\n", &host);
        assert!(m.is_offline_record());
    }

    #[test]
    fn missing_uptime_line_is_not_available() {
        let host = test_host("qdrant", "10.0.0.3");
        let m = parse_metrics_output("1.0\n1073741824 536870912\n0 0 0%\n", &host);
        assert!(m.online);
        assert_eq!(m.uptime, "N/A");
        assert_eq!(m.ram_percent, 50.0);
    }

    #[test]
    fn up_prefix_is_stripped_case_insensitively() {
        let host = test_host("qdrant", "10.0.0.3");
        let m = parse_metrics_output("1.0\n1 1\n1 1 1%\nUP   \n", &host);
        assert_eq!(m.uptime, "UP");
        let m = parse_metrics_output("1.0\n1 1\n1 1 1%\nUp 5 minutes\n", &host);
        assert_eq!(m.uptime, "5 minutes");
    }

    #[test]
    fn garbage_numbers_become_zero() {
        let host = test_host("zabbix", "10.0.0.4");
        let m = parse_metrics_output("n/a\nfoo bar\nx y z\nup 1 hour\n", &host);
        assert!(m.online);
        assert_eq!(m.cpu, 0.0);
        assert_eq!(m.ram_total, 0.0);
        assert_eq!(m.ram_percent, 0.0);
        assert_eq!(m.disk_total, 0.0);
        assert_eq!(m.disk_percent, 0);
        assert_eq!(m.uptime, "1 hour");
    }

    #[test]
    fn byte_fields_ignore_float_spellings() {
        let host = test_host("zabbix", "10.0.0.4");
        let m = parse_metrics_output("inf\ninf 1\n1e12 nan -5%\n", &host);
        assert!(m.online);
        assert_eq!(m.cpu, 0.0);
        assert_eq!(m.ram_total, 0.0);
        assert_eq!(m.ram_used, 0.0);
        assert_eq!(m.ram_percent, 0.0);
        assert_eq!(m.disk_total, 0.0);
        assert_eq!(m.disk_used, 0.0);
        assert_eq!(m.disk_percent, 0);

        let m = parse_metrics_output("0\n8589934592.9 4294967296kB\n0 0 0%\n", &host);
        assert_eq!(m.ram_total, 8.0);
        assert_eq!(m.ram_used, 4.0);
    }

    #[test]
    fn disk_percent_is_taken_from_df() {
        let host = test_host("ha", "10.0.0.5");
        let m = parse_metrics_output("0.0\n0 0\n107374182400 53687091200 47%\n", &host);
        assert_eq!(m.disk_used, 50.0);
        assert_eq!(m.disk_percent, 47);
    }

    #[test]
    fn comma_decimal_cpu_is_accepted() {
        let host = test_host("ha", "10.0.0.5");
        let m = parse_metrics_output("7,25\n0 0\n0 0 0%\n", &host);
        assert_eq!(m.cpu, 7.3);
    }
}
