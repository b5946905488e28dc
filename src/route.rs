use std::{collections::HashMap, error, fmt, io, net::Ipv4Addr, str::FromStr};

use log::debug;

pub const MAIN_TABLE: u32 = 254;

/// Policy routing table collaborator.
///
/// Returns `None` when the table doesn't exist, no route matches, or the matching route has
/// no concrete next hop.
pub trait RouteTable {
    fn lookup(&self, table_id: u32, destination: Ipv4Addr) -> Option<Ipv4Addr>;
}

impl<T: RouteTable + ?Sized> RouteTable for &T {
    fn lookup(&self, table_id: u32, destination: Ipv4Addr) -> Option<Ipv4Addr> {
        (**self).lookup(table_id, destination)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Hook {
    PreRouting,
    LocalOut,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreRouting => write!(f, "pre-routing"),
            Self::LocalOut => write!(f, "local-out"),
        }
    }
}

impl FromStr for Hook {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Hook, Self::Err> {
        match s.to_lowercase().as_str() {
            "pre-routing" | "prerouting" => Ok(Hook::PreRouting),
            "local-out" | "output" => Ok(Hook::LocalOut),
            _ => Err("Unsupported hook, must be pre-routing or local-out"),
        }
    }
}

/// Devices a packet was received on or is about to be sent from.
#[derive(Clone, Copy, Default, Debug)]
pub struct Interfaces<'a> {
    ingress: Option<&'a str>,
    egress: Option<&'a str>,
}

impl<'a> Interfaces<'a> {
    pub fn incoming(device: &'a str) -> Interfaces<'a> {
        Interfaces {
            ingress: Some(device),
            egress: None,
        }
    }

    pub fn outgoing(device: &'a str) -> Interfaces<'a> {
        Interfaces {
            ingress: None,
            egress: Some(device),
        }
    }

    pub fn device(&self) -> Option<&'a str> {
        self.ingress.or(self.egress)
    }

    pub fn hook(&self) -> Hook {
        if self.ingress.is_some() {
            Hook::PreRouting
        } else {
            Hook::LocalOut
        }
    }
}

/// Looks up ASN gateways in the configured table.
pub struct Resolver<R> {
    table: R,
    table_id: u32,
    debug: bool,
}

impl<R: RouteTable> Resolver<R> {
    pub fn new(table: R, table_id: u32, debug: bool) -> Resolver<R> {
        Resolver {
            table,
            table_id,
            debug,
        }
    }

    pub fn resolve(&self, destination: Ipv4Addr, interfaces: &Interfaces) -> Option<Ipv4Addr> {
        // Without a device, there's no context to route in.
        interfaces.device()?;
        let gateway = self.table.lookup(self.table_id, destination)?;
        if gateway.is_unspecified() {
            return None;
        }
        if self.debug {
            debug!("Found gateway {gateway} for {destination}");
        }
        Some(gateway)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum NextHop {
    Gateway(Ipv4Addr),
    Device(String),
}

#[derive(Clone, Debug)]
pub struct Route {
    prefix: Ipv4Addr,
    prefix_length: u8,
    next_hop: NextHop,
}

impl Route {
    pub fn new(
        prefix: Ipv4Addr,
        prefix_length: u8,
        next_hop: NextHop,
    ) -> Result<Route, RouteError> {
        if prefix_length > 32 {
            return Err("Prefix length exceeds 32 bits".into());
        }
        if u32::from(prefix) & !Self::mask(prefix_length) != 0 {
            return Err("Invalid prefix for given prefix length".into());
        }
        Ok(Route {
            prefix,
            prefix_length,
            next_hop,
        })
    }

    fn mask(prefix_length: u8) -> u32 {
        if prefix_length == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_length as u32)
        }
    }

    fn matches(&self, addr: Ipv4Addr) -> bool {
        let mask = Self::mask(self.prefix_length);
        u32::from(addr) & mask == u32::from(self.prefix)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.prefix_length)?;
        match &self.next_hop {
            NextHop::Gateway(gateway) => write!(f, " via {gateway}"),
            NextHop::Device(device) => write!(f, " dev {device}"),
        }
    }
}

/// In-memory longest-prefix-match tables, keyed by table ID.
#[derive(Default)]
pub struct StaticRouteTable {
    tables: HashMap<u32, Vec<Route>>,
}

impl StaticRouteTable {
    pub fn new() -> StaticRouteTable {
        StaticRouteTable::default()
    }

    pub fn add_route(&mut self, table_id: u32, route: Route) {
        self.tables.entry(table_id).or_default().push(route);
    }

    pub fn route_count(&self) -> usize {
        self.tables.values().map(|routes| routes.len()).sum()
    }

    pub fn routes(&self) -> impl Iterator<Item = (u32, &Route)> {
        self.tables
            .iter()
            .flat_map(|(table_id, routes)| routes.iter().map(|route| (*table_id, route)))
    }

    pub async fn load(path: &str) -> Result<StaticRouteTable, RouteError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::parse(&contents)
    }

    /// Parses routes in a subset of the `ip route` syntax:
    /// `<prefix>/<len>|default (via <gateway>|dev <device>) [table <id>]`.
    pub fn parse(contents: &str) -> Result<StaticRouteTable, RouteError> {
        let mut table = StaticRouteTable::new();
        for (i, line) in contents.lines().enumerate() {
            let line = match line.split_once('#') {
                Some((line, _comment)) => line,
                None => line,
            };
            if line.trim().is_empty() {
                continue;
            }
            let (table_id, route) =
                Self::parse_line(line).map_err(|msg| RouteError::Parse(i + 1, msg))?;
            table.add_route(table_id, route);
        }
        Ok(table)
    }

    fn parse_line(line: &str) -> Result<(u32, Route), &'static str> {
        let mut tokens = line.split_whitespace();
        let (prefix, prefix_length) = match tokens.next() {
            Some("default") => (Ipv4Addr::UNSPECIFIED, 0),
            Some(destination) => match destination.split_once('/') {
                Some((addr, len)) => (
                    Ipv4Addr::from_str(addr).map_err(|_| "Invalid destination address")?,
                    u8::from_str(len).map_err(|_| "Invalid prefix length")?,
                ),
                None => (
                    Ipv4Addr::from_str(destination).map_err(|_| "Invalid destination address")?,
                    32,
                ),
            },
            None => return Err("Route has no destination"),
        };
        let mut gateway = None;
        let mut device = None;
        let mut table_id = MAIN_TABLE;
        while let Some(keyword) = tokens.next() {
            let value = tokens.next().ok_or("Keyword has no value")?;
            match keyword {
                "via" => {
                    gateway =
                        Some(Ipv4Addr::from_str(value).map_err(|_| "Invalid gateway address")?)
                }
                "dev" => device = Some(value.to_string()),
                "table" => {
                    table_id = match value {
                        "main" => MAIN_TABLE,
                        _ => u32::from_str(value).map_err(|_| "Invalid table ID")?,
                    }
                }
                _ => return Err("Unsupported route keyword"),
            }
        }
        let next_hop = match (gateway, device) {
            (Some(gateway), _) => NextHop::Gateway(gateway),
            (None, Some(device)) => NextHop::Device(device),
            (None, None) => return Err("Route needs a gateway or a device"),
        };
        let route = Route::new(prefix, prefix_length, next_hop).map_err(|err| match err {
            RouteError::Internal(msg) => msg,
            _ => "Invalid route",
        })?;
        Ok((table_id, route))
    }
}

impl RouteTable for StaticRouteTable {
    fn lookup(&self, table_id: u32, destination: Ipv4Addr) -> Option<Ipv4Addr> {
        let route = self
            .tables
            .get(&table_id)?
            .iter()
            .filter(|route| route.matches(destination))
            .max_by_key(|route| route.prefix_length)?;
        match route.next_hop {
            NextHop::Gateway(gateway) => Some(gateway),
            NextHop::Device(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum RouteError {
    Internal(&'static str),
    Parse(usize, &'static str),
    Io(io::Error),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Parse(line, msg) => write!(f, "Route parse error on line {line}: {msg}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl error::Error for RouteError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::Parse(_line, _msg) => None,
            Self::Io(err) => Some(err),
        }
    }
}

impl From<&'static str> for RouteError {
    fn from(msg: &'static str) -> RouteError {
        Self::Internal(msg)
    }
}

impl From<io::Error> for RouteError {
    fn from(err: io::Error) -> RouteError {
        Self::Io(err)
    }
}
