#![forbid(unsafe_code)]

use palisade_core::{
    AddrMatch, Engine, FilterAction, PortMatch, Rule, format_checksum, format_flags,
    format_tunable, parse_flags,
};
use packet_types::{AddrFamily, IpProtocol, PacketHeader};
use std::net::IpAddr;
use std::path::Path;

mod runtime_config;
use runtime_config::load_runtime_config;

fn main() {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_usage_and_exit();
        return;
    };

    let result = match cmd.as_str() {
        "eval" => cmd_eval(args.collect()),
        "tunables" => cmd_tunables(args.collect()),
        "cksum" => cmd_cksum(args.collect()),
        "flags" => cmd_flags(args.collect()),
        _ => Err(format!("Unknown command: {}", cmd)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_eval(args: Vec<String>) -> Result<(), String> {
    let mut rule_lines: Vec<String> = Vec::new();
    let mut packet_spec: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rule" => {
                if let Some(line) = iter.next() {
                    rule_lines.push(line.clone());
                }
            }
            "--packet" => packet_spec = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let packet_spec = packet_spec.ok_or("Missing --packet \"<packet spec>\"")?;

    let config = load_runtime_config(Path::new("."))?;
    log::debug!("runtime config: {config:?}");
    let engine = Engine::new(config.engine_config()?);
    let rules = rule_lines
        .iter()
        .map(|line| parse_rule_line(line))
        .collect::<Result<Vec<Rule>, String>>()?;
    engine.reload(rules).map_err(|e| e.to_string())?;

    let header = parse_packet_spec(&packet_spec)?;
    let verdict = engine.evaluate(&header);
    match verdict.rule {
        Some(id) => println!("Verdict: {:?} (rule {id})", verdict.action),
        None => println!("Verdict: {:?} (default policy)", verdict.action),
    }
    Ok(())
}

fn cmd_tunables(args: Vec<String>) -> Result<(), String> {
    let config = load_runtime_config(Path::new("."))?;
    let engine = Engine::new(config.engine_config()?);
    match args.as_slice() {
        [] => {
            print!("{}", engine.format_tunables());
            Ok(())
        }
        [name] => {
            let tunable = engine.get_tunable(name).map_err(|e| e.to_string())?;
            print!("{}", format_tunable(&tunable));
            Ok(())
        }
        [name, value] => {
            let value = parse_number(value)?;
            engine.set_tunable(name, value).map_err(|e| e.to_string())?;
            let tunable = engine.get_tunable(name).map_err(|e| e.to_string())?;
            print!("{}", format_tunable(&tunable));
            Ok(())
        }
        _ => Err("Usage: palisade tunables [name [value]]".into()),
    }
}

fn cmd_cksum(args: Vec<String>) -> Result<(), String> {
    let [raw] = args.as_slice() else {
        return Err("Usage: palisade cksum <value>".into());
    };
    let raw = parse_number(raw)?;
    let raw = u32::try_from(raw).map_err(|_| "checksum value exceeds 32 bits".to_string())?;
    println!("{}", format_checksum(raw));
    Ok(())
}

fn cmd_flags(args: Vec<String>) -> Result<(), String> {
    let [text] = args.as_slice() else {
        return Err("Usage: palisade flags <spec>".into());
    };
    let (set, mask) = parse_flags(text).map_err(|e| e.to_string())?;
    println!("set  0x{set:04x} ({})", format_flags(set));
    println!("mask 0x{mask:04x} ({})", format_flags(mask));
    Ok(())
}

fn parse_rule_line(line: &str) -> Result<Rule, String> {
    let mut parts = line.split_whitespace();
    let first = parts.next().ok_or("empty rule line")?;
    let action = match first {
        "pass" => FilterAction::Pass,
        "block" => FilterAction::Block,
        "skip" => {
            let count = parts
                .next()
                .ok_or("missing skip count")?
                .parse()
                .map_err(|_| "invalid skip count")?;
            FilterAction::Skip(count)
        }
        _ => return Err("rule must start with pass/block/skip".into()),
    };

    let mut family: Option<AddrFamily> = None;
    let mut quick = false;
    let mut log = false;
    let mut keep_state = false;
    let mut protocol: Option<IpProtocol> = None;
    let mut src: Option<AddrMatch> = None;
    let mut dst: Option<AddrMatch> = None;
    let mut src_ports: Option<PortMatch> = None;
    let mut dst_ports: Option<PortMatch> = None;
    let mut flag_match: Option<(u16, u16)> = None;

    while let Some(tok) = parts.next() {
        match tok {
            "inet" => family = Some(AddrFamily::V4),
            "inet6" => family = Some(AddrFamily::V6),
            "quick" => quick = true,
            "log" => log = true,
            "keep-state" => keep_state = true,
            "proto" => protocol = Some(parse_protocol(parts.next())?),
            "from" => src = parse_addr_match(parts.next().ok_or("missing from address")?)?,
            "to" => dst = parse_addr_match(parts.next().ok_or("missing to address")?)?,
            "sport" => {
                src_ports = Some(parse_port_range(parts.next().ok_or("missing sport value")?)?)
            }
            "dport" => {
                dst_ports = Some(parse_port_range(parts.next().ok_or("missing dport value")?)?)
            }
            "flags" => {
                let spec = parts.next().ok_or("missing flags value")?;
                let (set, mask) = parse_flags(spec).map_err(|e| e.to_string())?;
                flag_match = Some((set, mask));
            }
            other => return Err(format!("unknown token {other}")),
        }
    }

    if let (Some(s), Some(d)) = (&src, &dst)
        && s.family() != d.family()
    {
        return Err("from/to address families differ".into());
    }
    let family = family
        .or(src.as_ref().map(|m| m.family()))
        .or(dst.as_ref().map(|m| m.family()))
        .unwrap_or(AddrFamily::V4);

    let mut builder = Rule::build(family, action);
    if let Some(m) = src {
        builder = builder.src(m);
    }
    if let Some(m) = dst {
        builder = builder.dst(m);
    }
    if let Some(p) = protocol {
        builder = builder.protocol(p);
    }
    if let Some(r) = src_ports {
        builder = builder.src_ports(r);
    }
    if let Some(r) = dst_ports {
        builder = builder.dst_ports(r);
    }
    if let Some((set, mask)) = flag_match {
        builder = builder.flags(set, mask);
    }
    if quick {
        builder = builder.quick();
    }
    if log {
        builder = builder.log();
    }
    if keep_state {
        builder = builder.keep_state();
    }
    Ok(builder.finish())
}

fn parse_packet_spec(spec: &str) -> Result<PacketHeader, String> {
    let mut parts = spec.split_whitespace();
    let mut protocol: Option<IpProtocol> = None;
    let mut src: Option<IpAddr> = None;
    let mut dst: Option<IpAddr> = None;
    let mut src_port: Option<u16> = None;
    let mut dst_port: Option<u16> = None;
    let mut flags: Option<u16> = None;

    while let Some(tok) = parts.next() {
        match tok {
            "proto" => protocol = Some(parse_protocol(parts.next())?),
            "src" => {
                let v = parts.next().ok_or("missing src address")?;
                src = Some(v.parse().map_err(|_| format!("invalid src address {v}"))?);
            }
            "dst" => {
                let v = parts.next().ok_or("missing dst address")?;
                dst = Some(v.parse().map_err(|_| format!("invalid dst address {v}"))?);
            }
            "sport" => {
                let v = parts.next().ok_or("missing sport value")?;
                src_port = Some(v.parse().map_err(|_| "invalid sport")?);
            }
            "dport" => {
                let v = parts.next().ok_or("missing dport value")?;
                dst_port = Some(v.parse().map_err(|_| "invalid dport")?);
            }
            "flags" => {
                let spec = parts.next().ok_or("missing flags value")?;
                let (set, _) = parse_flags(spec).map_err(|e| e.to_string())?;
                flags = Some(set);
            }
            other => return Err(format!("unknown token {other}")),
        }
    }

    let protocol = protocol.ok_or("missing proto")?;
    let src = src.ok_or("missing src address")?;
    let dst = dst.ok_or("missing dst address")?;
    if src.is_ipv4() != dst.is_ipv4() {
        return Err("src/dst address families differ".into());
    }
    Ok(PacketHeader {
        src_addr: src,
        dst_addr: dst,
        protocol,
        src_port,
        dst_port,
        tcp_flags: flags,
    })
}

fn parse_protocol(token: Option<&str>) -> Result<IpProtocol, String> {
    match token {
        Some("tcp") => Ok(IpProtocol::Tcp),
        Some("udp") => Ok(IpProtocol::Udp),
        Some("icmp") => Ok(IpProtocol::Icmpv4),
        Some("icmpv6") => Ok(IpProtocol::Icmpv6),
        Some(other) => other
            .parse::<u8>()
            .map(IpProtocol::from_number)
            .map_err(|_| format!("unknown protocol {other}")),
        None => Err("missing protocol".into()),
    }
}

fn parse_addr_match(text: &str) -> Result<Option<AddrMatch>, String> {
    if text == "any" {
        return Ok(None);
    }
    let (addr_text, prefix) = match text.split_once('/') {
        Some((a, p)) => (
            a,
            Some(p.parse::<u8>().map_err(|_| "invalid prefix length")?),
        ),
        None => (text, None),
    };
    let addr: IpAddr = addr_text
        .parse()
        .map_err(|_| format!("invalid address {addr_text}"))?;
    let matched = match addr {
        IpAddr::V4(v4) => {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return Err("prefix too long for an IPv4 address".into());
            }
            AddrMatch::v4_prefix(v4, prefix)
        }
        IpAddr::V6(v6) => {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return Err("prefix too long for an IPv6 address".into());
            }
            AddrMatch::v6_prefix(v6, prefix)
        }
    };
    Ok(Some(matched))
}

fn parse_port_range(text: &str) -> Result<PortMatch, String> {
    if let Some((start, end)) = text.split_once('-') {
        Ok(PortMatch::new(
            start.parse().map_err(|_| "invalid port")?,
            end.parse().map_err(|_| "invalid port")?,
        ))
    } else {
        Ok(PortMatch::single(
            text.parse().map_err(|_| "invalid port")?,
        ))
    }
}

fn parse_number(text: &str) -> Result<u64, String> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| format!("invalid number {text}"))
    } else {
        text.parse().map_err(|_| format!("invalid number {text}"))
    }
}

fn print_usage_and_exit() {
    eprintln!("Usage:");
    eprintln!(
        "  palisade eval --rule \"block quick proto tcp dport 22\" --packet \"proto tcp src 10.0.0.1 dst 10.0.0.2 sport 50000 dport 22 flags S\""
    );
    eprintln!("  palisade tunables [name [value]]");
    eprintln!("  palisade cksum 0x80001234");
    eprintln!("  palisade flags SA/SAFR");
    std::process::exit(1);
}
