use std::net::IpAddr;

/// Parses a PROXY protocol v1 header line
/// (`PROXY TCP4|TCP6 <src> <dst> <sport> <dport>`) and returns the
/// original client address.
pub fn parse_proxy_line(line: &str) -> Option<IpAddr> {
    let mut parts = line.trim_end_matches(['\r', '\n']).split(' ');
    if parts.next()? != "PROXY" {
        return None;
    }
    let family = parts.next()?;
    let src: IpAddr = parts.next()?.parse().ok()?;
    let _dst: IpAddr = parts.next()?.parse().ok()?;
    let _sport: u16 = parts.next()?.parse().ok()?;
    let _dport: u16 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    match (family, src) {
        ("TCP4", IpAddr::V4(_)) | ("TCP6", IpAddr::V6(_)) => Some(src),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp4_and_tcp6() {
        assert_eq!(
            parse_proxy_line("PROXY TCP4 203.0.113.9 10.0.0.1 51234 3333\r\n"),
            Some("203.0.113.9".parse().unwrap())
        );
        assert_eq!(
            parse_proxy_line("PROXY TCP6 2001:db8::1 2001:db8::2 4000 3333"),
            Some("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn rejects_other_lines() {
        assert_eq!(parse_proxy_line(r#"{"id":1,"method":"mining.subscribe"}"#), None);
        assert_eq!(parse_proxy_line("PROXY UNKNOWN"), None);
        assert_eq!(parse_proxy_line("PROXY TCP4 2001:db8::1 10.0.0.1 1 2"), None);
        assert_eq!(parse_proxy_line("PROXY TCP4 1.2.3.4 10.0.0.1 1"), None);
    }
}
