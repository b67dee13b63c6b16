use super::{ConnectOptions, Engine};

pub fn parse_engine(s: &str) -> Option<Engine> {
    match s.to_lowercase().as_str() {
        "memory" | "mem" => Some(Engine::Memory),
        "nats" => Some(Engine::Nats),
        _ => None,
    }
}

pub fn parse_connect_kv(pairs: &[String]) -> ConnectOptions {
    let mut opts = ConnectOptions::default();
    for p in pairs {
        if let Some((k, v)) = p.split_once('=') {
            opts.params.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    opts
}
