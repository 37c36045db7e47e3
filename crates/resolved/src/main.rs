mod fs;
mod metrics;
mod net;
mod resolver;
mod settings;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use dns_authority::auth::Keys;
use dns_authority::engine::SideEffect;
use dns_authority::primary::{Peer, PrimaryState};
use dns_authority::secondary::{self, Action, SecondaryZone};
use dns_resolver::cache::Cache;
use dns_types::protocol::types::*;
use dns_types::zones::trie::{LookupFailure, Trie};

use crate::metrics::*;
use crate::net::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes_to, TcpError};
use crate::settings::Settings;

const DNS_PORT: u16 = 53;

/// A simple authoritative and recursive DNS server.
///
/// It serves zones it is authoritative for straight from its own
/// store, accepts RFC 2136 dynamic updates and RFC 1996 NOTIFY/AXFR
/// transfers for keys it trusts, and falls back to recursive
/// resolution (backed by a cache) for everything else.
#[derive(Debug, Parser, Clone)]
struct Args {
    /// Path to a YAML settings file.
    #[clap(short, long, value_parser, default_value = "resolved.yaml")]
    config: String,

    /// Interface to listen on to serve Prometheus metrics.
    #[clap(long, value_parser, default_value_t = Ipv4Addr::LOCALHOST)]
    metrics_interface: Ipv4Addr,

    /// Port to listen on to serve Prometheus metrics.
    #[clap(long, value_parser, default_value_t = 9420)]
    metrics_port: u16,
}

#[derive(Clone)]
struct Shared {
    trie: Arc<Mutex<Trie>>,
    keys: Arc<Mutex<Keys>>,
    cache: Arc<Mutex<Cache>>,
    primary: Arc<Mutex<PrimaryState>>,
    secondaries: Arc<Mutex<Vec<SecondaryZone>>>,
    authoritative_only: bool,
    own_ns: DomainName,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    begin_logging();

    let settings = match Settings::new(&args.config) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not load settings");
            process::exit(1);
        }
    };

    let mut trie = Trie::new();
    let mut keys = Keys::new();
    if load_configuration(&settings, &mut trie, &mut keys).await.is_none() {
        tracing::error!("could not load zone/key configuration");
        process::exit(1);
    }

    let mut cache = Cache::with_desired_size(settings.cache_size.unwrap_or(512));
    if !settings.authoritative_only {
        resolver::seed_root_hints(&mut cache);
    }

    let now = Instant::now();
    let secondaries = settings
        .secondary_zones
        .iter()
        .filter_map(|sc| {
            let zone = DomainName::from_dotted_string(&sc.zone)?;
            let key_name = sc.key_name.as_deref().and_then(DomainName::from_dotted_string);
            Some(SecondaryZone::bootstrap(zone, sc.primary_ip, sc.primary_port, key_name, now))
        })
        .collect();

    let shared = Shared {
        trie: Arc::new(Mutex::new(trie)),
        keys: Arc::new(Mutex::new(keys)),
        cache: Arc::new(Mutex::new(cache)),
        primary: Arc::new(Mutex::new(PrimaryState::new())),
        secondaries: Arc::new(Mutex::new(secondaries)),
        authoritative_only: settings.authoritative_only,
        own_ns: DomainName::from_dotted_string("localhost.").expect("valid name"),
    };

    let interface = settings.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);

    tracing::info!(%interface, port = %DNS_PORT, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((interface, DNS_PORT)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(%interface, port = %DNS_PORT, "binding DNS TCP socket");
    let tcp = match TcpListener::bind((interface, DNS_PORT)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    tokio::spawn(listen_udp_task(shared.clone(), udp));
    tokio::spawn(listen_tcp_task(shared.clone(), tcp));
    tokio::spawn(primary_notify_task(shared.clone()));
    tokio::spawn(cache_metrics_task(shared.clone()));
    tokio::spawn(secondary_zones_task(shared.clone()));

    tracing::info!(interface = %args.metrics_interface, port = %args.metrics_port, "binding metrics HTTP socket");
    if let Err(error) = serve_prometheus_endpoint_task((args.metrics_interface, args.metrics_port).into()).await {
        tracing::error!(?error, "could not bind metrics HTTP socket");
        process::exit(1);
    }
}

/// Load zone files, zone directories, and DNSKEY-bearing key files
/// into `trie`/`keys`.
async fn load_configuration(settings: &Settings, trie: &mut Trie, keys: &mut Keys) -> Option<()> {
    let mut is_error = false;
    let mut zone_file_paths: Vec<PathBuf> = settings.zone_files.iter().map(PathBuf::from).collect();

    for dir in &settings.zone_dirs {
        match fs::get_files_from_dir(Path::new(dir)).await {
            Ok(mut paths) => zone_file_paths.append(&mut paths),
            Err(error) => {
                tracing::warn!(?dir, ?error, "could not read zone directory");
                is_error = true;
            }
        }
    }

    for path in &zone_file_paths {
        match fs::zone_from_file(path).await {
            Ok(Ok(zone)) => trie.insert_zone(&zone),
            Ok(Err(error)) => {
                tracing::warn!(?path, ?error, "could not parse zone file");
                is_error = true;
            }
            Err(error) => {
                tracing::warn!(?path, ?error, "could not read zone file");
                is_error = true;
            }
        }
    }

    for path in &settings.key_files {
        match fs::zone_from_file(path).await {
            Ok(Ok(zone)) => {
                for (name, zrs) in zone.all_records() {
                    for zr in zrs {
                        if zr.rtype_with_data.rtype() == RecordType::DNSKEY {
                            keys.handle_update(name, zr.rtype_with_data.clone(), true);
                        }
                    }
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(?path, ?error, "could not parse key file");
                is_error = true;
            }
            Err(error) => {
                tracing::warn!(?path, ?error, "could not read key file");
                is_error = true;
            }
        }
    }

    if is_error {
        None
    } else {
        Some(())
    }
}

async fn listen_udp_task(shared: Shared, socket: UdpSocket) {
    let socket = Arc::new(socket);
    let (tx, mut rx) = mpsc::channel::<(Message, SocketAddr)>(32);
    let mut buf = vec![0u8; 512];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                DNS_REQUESTS_TOTAL.with_label_values(&["udp"]).inc();
                let bytes = BytesMut::from(&buf[..size]);
                let shared = shared.clone();
                let reply_tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(response) = handle_raw_message(&shared, bytes.as_ref(), peer.ip(), peer.port(), false).await {
                        let _ = reply_tx.send((response, peer)).await;
                    }
                });
            }
            Some((message, peer)) = rx.recv() => {
                if let Ok(mut serialised) = message.to_octets() {
                    record_response_metric(&message);
                    if let Err(error) = send_udp_bytes_to(&socket, peer, &mut serialised).await {
                        tracing::debug!(?peer, ?error, "UDP send error");
                    }
                }
            }
        }
    }
}

async fn listen_tcp_task(shared: Shared, socket: TcpListener) {
    loop {
        match socket.accept().await {
            Ok((mut stream, peer)) => {
                DNS_REQUESTS_TOTAL.with_label_values(&["tcp"]).inc();
                let shared = shared.clone();
                tokio::spawn(async move {
                    let response = match read_tcp_bytes(&mut stream).await {
                        Ok(bytes) => handle_raw_message(&shared, bytes.as_ref(), peer.ip(), peer.port(), true).await,
                        Err(error) => {
                            let id = match error {
                                TcpError::TooShort { id, .. } | TcpError::IO { id, .. } => id,
                            };
                            tracing::debug!(?peer, ?error, "TCP read error");
                            id.map(Message::make_format_error_response)
                        }
                    };
                    if let Some(message) = response {
                        record_response_metric(&message);
                        if let Ok(mut serialised) = message.to_octets() {
                            if let Err(error) = send_tcp_bytes(&mut stream, &mut serialised).await {
                                tracing::debug!(?peer, ?error, "TCP send error");
                            }
                        }
                    }
                });
            }
            Err(error) => tracing::debug!(?error, "TCP accept error"),
        }
    }
}

async fn handle_raw_message(
    shared: &Shared,
    buf: &[u8],
    peer_ip: std::net::IpAddr,
    peer_port: u16,
    over_tcp: bool,
) -> Option<Message> {
    match Message::from_octets(buf) {
        Ok(msg) if msg.header.is_response => Some(Message::make_format_error_response(msg.header.id)),
        Ok(msg) => Some(dispatch(shared, &msg, peer_ip, peer_port, over_tcp).await),
        Err(error) => error.id().map(Message::make_format_error_response),
    }
}

/// Route a decoded request to the authority engine first; fall back
/// to recursive resolution when it reports the name isn't ours and
/// recursion was asked for.
async fn dispatch(shared: &Shared, msg: &Message, peer_ip: std::net::IpAddr, peer_port: u16, over_tcp: bool) -> Message {
    if msg.header.opcode != Opcode::Standard {
        let mut trie = shared.trie.lock().await;
        let mut keys = shared.keys.lock().await;
        let (reply, records, effects) =
            dns_authority::engine::handle(&mut trie, &mut keys, None, over_tcp, peer_ip, peer_port, msg);
        drop(trie);
        drop(keys);
        apply_side_effects(shared, effects).await;

        if let Some(reply) = reply {
            return reply;
        }

        // A successful AXFR: `handle` has no per-message framing
        // concept, so the whole transfer is packed into one reply
        // here (fine for the zone sizes this server is meant for).
        let mut r = msg.make_response();
        r.header.is_authoritative = true;
        r.answers = records;
        return r;
    }

    let authoritative = {
        let trie = shared.trie.lock().await;
        msg.questions.first().is_some_and(|q| {
            !matches!(trie.lookup_any(&q.name), Err(LookupFailure::NotAuthoritative))
        })
    };

    if authoritative || shared.authoritative_only {
        let mut trie = shared.trie.lock().await;
        let mut keys = shared.keys.lock().await;
        let (reply, _records, effects) = dns_authority::engine::handle(&mut trie, &mut keys, None, over_tcp, peer_ip, peer_port, msg);
        drop(trie);
        drop(keys);
        apply_side_effects(shared, effects).await;
        return reply.unwrap_or_else(|| {
            let mut r = msg.make_response();
            r.header.rcode = Rcode::ServerFailure;
            r
        });
    }

    let mut response = msg.make_response();
    response.header.recursion_available = true;

    if !msg.header.recursion_desired {
        response.header.rcode = Rcode::Refused;
        return response;
    }

    let mut cache = shared.cache.lock().await;
    for question in &msg.questions {
        match resolver::resolve_recursive(&mut cache, question).await {
            Ok((rcode, mut answer, mut authority)) => {
                response.answers.append(&mut answer);
                response.authority.append(&mut authority);
                if rcode != Rcode::NoError {
                    response.header.rcode = rcode;
                }
            }
            Err(error) => {
                tracing::debug!(?question, ?error, "recursive resolution failed");
                response.header.rcode = Rcode::ServerFailure;
            }
        }
    }

    response
}

async fn apply_side_effects(shared: &Shared, effects: Vec<SideEffect>) {
    for effect in effects {
        match effect {
            SideEffect::ZoneChanged { zone, soa } => {
                let trie = shared.trie.lock().await;
                let keys = shared.keys.lock().await;
                let mut primary = shared.primary.lock().await;
                let mut rng = StdRng::from_entropy();
                primary.notify(&trie, &keys, &mut rng, Instant::now(), zone, soa, &shared.own_ns);
            }
            SideEffect::Subscribe { zone, peer_ip, peer_port } => {
                let mut primary = shared.primary.lock().await;
                primary.subscribe(zone, Peer { ip: peer_ip, port: peer_port });
            }
            SideEffect::KeyChanged(_) => {}
        }
    }
}

/// Drive every configured secondary zone's refresh/retry/expire
/// schedule, issuing SOA and AXFR queries to its primary as due.
async fn secondary_zones_task(shared: Shared) {
    loop {
        sleep(Duration::from_secs(1)).await;
        let now = Instant::now();
        let mut rng = StdRng::from_entropy();

        let due: Vec<(usize, Action)> = {
            let mut zones = shared.secondaries.lock().await;
            zones
                .iter_mut()
                .enumerate()
                .filter_map(|(i, z)| z.timer(now, &mut rng).map(|a| (i, a)))
                .collect()
        };

        for (idx, action) in due {
            match action {
                Action::SendSoaQuery {
                    zone,
                    peer_ip,
                    peer_port,
                    query_id,
                } => {
                    let request = soa_query(query_id, &zone);
                    if let Some(response) = net::query_nameserver(SocketAddr::new(peer_ip, peer_port), &request).await {
                        handle_soa_response(&shared, idx, query_id, &response).await;
                    }
                }
                Action::SendAxfrQuery {
                    zone,
                    peer_ip,
                    peer_port,
                    query_id,
                } => {
                    let request = axfr_query(query_id, &zone);
                    if let Some(response) = net::query_nameserver(SocketAddr::new(peer_ip, peer_port), &request).await {
                        handle_axfr_response(&shared, idx, &zone, &response).await;
                    }
                }
                Action::DropZone { zone } => {
                    let mut trie = shared.trie.lock().await;
                    secondary::drop_zone(&mut trie, &zone);
                    tracing::warn!(%zone, "secondary zone expired, dropping");
                }
            }
        }
    }
}

fn soa_query(id: u16, zone: &DomainName) -> Message {
    Message {
        header: Header {
            id,
            is_response: false,
            opcode: Opcode::Standard,
            is_authoritative: false,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: false,
            rcode: Rcode::NoError,
        },
        questions: vec![Question {
            name: zone.clone(),
            qtype: QueryType::Record(RecordType::SOA),
            qclass: QueryClass::Record(RecordClass::IN),
        }],
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
    }
}

fn axfr_query(id: u16, zone: &DomainName) -> Message {
    Message {
        header: Header {
            id,
            is_response: false,
            opcode: Opcode::Status,
            is_authoritative: false,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: false,
            rcode: Rcode::NoError,
        },
        questions: vec![Question {
            name: zone.clone(),
            qtype: QueryType::AXFR,
            qclass: QueryClass::Record(RecordClass::IN),
        }],
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
    }
}

fn soa_of(rr: &ResourceRecord) -> Option<dns_types::zones::types::SOA> {
    match &rr.rtype_with_data {
        RecordTypeWithData::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => Some(dns_types::zones::types::SOA {
            mname: mname.clone(),
            rname: rname.clone(),
            serial: *serial,
            refresh: *refresh,
            retry: *retry,
            expire: *expire,
            minimum: *minimum,
        }),
        _ => None,
    }
}

async fn handle_soa_response(shared: &Shared, idx: usize, query_id: u16, response: &Message) {
    let Some(new_soa) = response.answers.first().and_then(soa_of) else {
        return;
    };

    let mut zones = shared.secondaries.lock().await;
    let Some(zone) = zones.get_mut(idx) else { return };
    let trie = shared.trie.lock().await;
    let serial_has_advanced = match trie.entries(zone.zone()) {
        Ok((current, _)) => serial_gt(new_soa.serial, current.serial),
        Err(_) => true,
    };
    drop(trie);
    zone.soa_received(Instant::now(), query_id, new_soa, serial_has_advanced);
}

async fn handle_axfr_response(shared: &Shared, idx: usize, zone_name: &DomainName, response: &Message) {
    let Some(soa) = response.answers.first().and_then(soa_of) else {
        return;
    };

    let mut zone = dns_types::zones::types::Zone::new(zone_name.clone(), Some(soa.clone()));
    for rr in response.answers.iter().skip(1) {
        if rr.rtype_with_data.rtype() != RecordType::SOA {
            zone.insert(&rr.name, rr.rtype_with_data.clone(), rr.ttl);
        }
    }

    {
        let mut trie = shared.trie.lock().await;
        secondary::drop_zone(&mut trie, zone_name);
        trie.insert_zone(&zone);
    }

    SECONDARY_TRANSFERS_APPLIED_TOTAL.inc();

    let mut zones = shared.secondaries.lock().await;
    if let Some(z) = zones.get_mut(idx) {
        z.axfr_applied(Instant::now(), soa);
    }
}

/// RFC 1982 serial number arithmetic: is `a` strictly newer than `b`?
fn serial_gt(a: u32, b: u32) -> bool {
    a != b && (a.wrapping_sub(b) < (1 << 31))
}

/// Periodically (re)send outstanding NOTIFYs on their retransmission
/// schedule.
async fn primary_notify_task(shared: Shared) {
    loop {
        sleep(Duration::from_secs(1)).await;
        let due = {
            let mut primary = shared.primary.lock().await;
            primary.timer(Instant::now())
        };
        for (peer, message) in due {
            PRIMARY_NOTIFICATIONS_SENT_TOTAL.inc();
            if let Ok(mut serialised) = message.to_octets() {
                if let Ok(sock) = UdpSocket::bind("0.0.0.0:0").await {
                    let _ = send_udp_bytes_to(&sock, SocketAddr::new(peer.ip, peer.port), &mut serialised).await;
                }
            }
        }
    }
}

/// Snapshot the cache's cumulative stats into Prometheus counters
/// every few seconds.
async fn cache_metrics_task(shared: Shared) {
    let mut previous = dns_resolver::cache::Stats::default();
    loop {
        sleep(Duration::from_secs(10)).await;
        let (stats, size) = {
            let cache = shared.cache.lock().await;
            (cache.stats(), cache.len())
        };

        CACHE_SIZE.set(i64::try_from(size).unwrap_or(i64::MAX));
        DNS_RESOLVER_CACHE_HIT_TOTAL.inc_by(stats.hit.saturating_sub(previous.hit));
        DNS_RESOLVER_CACHE_MISS_TOTAL.inc_by(stats.miss.saturating_sub(previous.miss));
        DNS_RESOLVER_CACHE_DROP_TOTAL.inc_by(stats.drop.saturating_sub(previous.drop));
        DNS_RESOLVER_CACHE_INSERT_TOTAL.inc_by(stats.insert.saturating_sub(previous.insert));

        previous = stats;
    }
}

fn record_response_metric(message: &Message) {
    DNS_RESPONSES_TOTAL
        .with_label_values(&[
            &message.header.is_authoritative.to_string(),
            &message.header.is_truncated.to_string(),
            &message.header.recursion_desired.to_string(),
            &message.header.recursion_available.to_string(),
            &message.header.rcode.to_string(),
        ])
        .inc();
}

fn begin_logging() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
}
