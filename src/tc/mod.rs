//! Traffic control on hosts.
//!
//! A host can ask for its network traffic to be shaped: capped rates,
//! loss, corruption, duplication, delay. The settings live with the
//! host section; this module parses them, works out per-direction
//! restrictions from what the clients on the host can promise about
//! their ports, and drives a [`TrafficShaper`] implementation to
//! install and remove the shaping.
//!
//! Restrictions are negotiated downward: port-restricted shaping is
//! preferred, but protocol mismatches or clients without fixed ports
//! widen it to all traffic, and a failing capability check walks a
//! fallback ladder (unrestricted inbound, unrestricted outbound, both)
//! before giving up.

pub mod netem;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::{AppError, AppResult, ConfigError, TcError};
use crate::host::Host;

/// A rate as given in a scenario file, e.g. `10mbit` or `512kbit`.
/// A bare number is taken as mbit.
#[derive(Clone, Debug)]
pub struct Speed {
    text: String,
    bits: u64,
}

impl Speed {
    /// # Errors
    ///
    /// Fails when the value is not a positive integer with an optional
    /// `kbit`/`mbit` suffix.
    pub fn parse(value: &str) -> Result<Self, TcError> {
        let invalid = || TcError::InvalidSpeed {
            value: value.to_owned(),
        };
        let (number, shift, suffix) = if let Some(prefix) = value.strip_suffix("mbit") {
            (prefix, 20_u32, "mbit")
        } else if let Some(prefix) = value.strip_suffix("kbit") {
            (prefix, 10_u32, "kbit")
        } else {
            (value, 20_u32, "mbit")
        };
        let amount: u64 = number.parse().map_err(|_| invalid())?;
        if amount == 0 {
            return Err(invalid());
        }
        Ok(Self {
            text: format!("{amount}{suffix}"),
            bits: amount.checked_shl(shift).unwrap_or(u64::MAX),
        })
    }

    /// The normalized text form, as handed to `tc`.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub const fn bits(&self) -> u64 {
        self.bits
    }
}

/// A percentage chance, kept as text for `tc` plus an integer value in
/// millionths of a percent for comparisons.
#[derive(Clone, Debug)]
pub struct Chance {
    text: String,
    micropercent: u64,
}

impl Chance {
    /// # Errors
    ///
    /// Fails when the value is not a number between 0 and 100.
    pub fn parse(value: &str) -> Result<Self, TcError> {
        let invalid = || TcError::InvalidChance {
            value: value.to_owned(),
        };
        let (whole, fraction) = match value.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (value, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let whole_part: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        if !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let mut scaled = whole_part.checked_mul(1_000_000).ok_or_else(invalid)?;
        let mut weight = 100_000_u64;
        for digit in fraction.chars().take(6) {
            let value = u64::from(digit.to_digit(10).unwrap_or(0));
            scaled = scaled
                .checked_add(value.saturating_mul(weight))
                .ok_or_else(invalid)?;
            weight = weight.checked_div(10).unwrap_or(0);
        }
        if scaled > 100_000_000 {
            return Err(invalid());
        }
        Ok(Self {
            text: value.to_owned(),
            micropercent: scaled,
        })
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.micropercent == 0
    }
}

/// Traffic control settings of one host.
#[derive(Default)]
pub struct TcSettings {
    module: Option<String>,
    interface: Option<String>,
    down: Option<Speed>,
    down_burst: Option<Speed>,
    up: Option<Speed>,
    up_burst: Option<Speed>,
    loss: Option<Chance>,
    corruption: Option<Chance>,
    duplication: Option<Chance>,
    delay_ms: u32,
    jitter_ms: u32,
}

impl TcSettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn duplicate(key: &str) -> AppError {
        AppError::config(ConfigError::DuplicateParameter {
            section: "host".to_owned(),
            key: key.to_owned(),
        })
    }

    /// Parse one `key=value` pair. Returns false when the key is not a
    /// traffic control setting.
    ///
    /// # Errors
    ///
    /// Fails on duplicate keys and unusable values.
    pub fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool> {
        match key {
            "tc" => {
                if self.module.is_some() {
                    return Err(Self::duplicate(key));
                }
                if value.is_empty() {
                    return Ok(true);
                }
                crate::config::syntax::validate_name(value).map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source,
                    })
                })?;
                self.module = Some(value.to_owned());
            }
            "tc_iface" | "tcInterface" => {
                if self.interface.is_some() {
                    return Err(Self::duplicate(key));
                }
                if value.is_empty() {
                    return Err(AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source: crate::error::ValidationError::ValueEmpty,
                    }));
                }
                self.interface = Some(value.to_owned());
            }
            "tc_down" | "tcMaxDownSpeed" => {
                if self.down.is_some() {
                    return Err(Self::duplicate(key));
                }
                self.down = Some(Speed::parse(value).map_err(AppError::tc)?);
            }
            "tc_down_burst" | "tcMaxDownBurst" => {
                if self.down_burst.is_some() {
                    return Err(Self::duplicate(key));
                }
                self.down_burst = Some(Speed::parse(value).map_err(AppError::tc)?);
            }
            "tc_up" | "tcMaxUpSpeed" => {
                if self.up.is_some() {
                    return Err(Self::duplicate(key));
                }
                self.up = Some(Speed::parse(value).map_err(AppError::tc)?);
            }
            "tc_up_burst" | "tcMaxUpBurst" => {
                if self.up_burst.is_some() {
                    return Err(Self::duplicate(key));
                }
                self.up_burst = Some(Speed::parse(value).map_err(AppError::tc)?);
            }
            "tc_loss" | "tcLossChance" => {
                if self.loss.is_some() {
                    return Err(Self::duplicate(key));
                }
                self.loss = Some(Chance::parse(value).map_err(AppError::tc)?);
            }
            "tc_corruption" | "tcCorruptionChance" => {
                if self.corruption.is_some() {
                    return Err(Self::duplicate(key));
                }
                self.corruption = Some(Chance::parse(value).map_err(AppError::tc)?);
            }
            "tc_duplication" | "tcDuplicationChance" => {
                if self.duplication.is_some() {
                    return Err(Self::duplicate(key));
                }
                self.duplication = Some(Chance::parse(value).map_err(AppError::tc)?);
            }
            "tc_delay" | "tcDelay" => {
                if self.delay_ms != 0 {
                    return Err(Self::duplicate(key));
                }
                let parsed =
                    crate::config::syntax::parse_positive_u64(value).map_err(|source| {
                        AppError::config(ConfigError::InvalidValue {
                            key: key.to_owned(),
                            source,
                        })
                    })?;
                self.delay_ms = u32::try_from(parsed).unwrap_or(u32::MAX);
            }
            "tc_jitter" | "tcJitter" => {
                if self.jitter_ms != 0 {
                    return Err(Self::duplicate(key));
                }
                let parsed =
                    crate::config::syntax::parse_positive_u64(value).map_err(|source| {
                        AppError::config(ConfigError::InvalidValue {
                            key: key.to_owned(),
                            source,
                        })
                    })?;
                self.jitter_ms = u32::try_from(parsed).unwrap_or(u32::MAX);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn has_shaping(&self) -> bool {
        self.down.is_some()
            || self.down_burst.is_some()
            || self.up.is_some()
            || self.up_burst.is_some()
            || self.loss.as_ref().is_some_and(|c| !c.is_zero())
            || self.corruption.as_ref().is_some_and(|c| !c.is_zero())
            || self.duplication.as_ref().is_some_and(|c| !c.is_zero())
            || self.delay_ms != 0
            || self.jitter_ms != 0
    }

    /// Validate the collected settings and apply defaults.
    ///
    /// # Errors
    ///
    /// Fails on parameters without a module, a module without
    /// parameters, bursts without rates or a jitter above the delay.
    pub fn check(&mut self, host: &str) -> AppResult<()> {
        if self.module.is_none() {
            if self.has_shaping() || self.interface.is_some() {
                return Err(AppError::tc(TcError::RestrictionsWithoutTc {
                    host: host.to_owned(),
                }));
            }
            return Ok(());
        }
        if !self.has_shaping() {
            return Err(AppError::tc(TcError::NoDirection {
                host: host.to_owned(),
            }));
        }
        if self.interface.is_none() {
            self.interface = Some("eth0".to_owned());
        }
        Self::check_burst(host, "download", self.down_burst.as_ref(), self.down.as_ref())?;
        Self::check_burst(host, "upload", self.up_burst.as_ref(), self.up.as_ref())?;
        if self.jitter_ms != 0 && self.jitter_ms > self.delay_ms {
            return Err(AppError::tc(TcError::JitterExceedsDelay {
                host: host.to_owned(),
                jitter: self.jitter_ms,
                delay: self.delay_ms,
            }));
        }
        Ok(())
    }

    fn check_burst(
        host: &str,
        direction: &'static str,
        burst: Option<&Speed>,
        rate: Option<&Speed>,
    ) -> AppResult<()> {
        let Some(burst) = burst else {
            return Ok(());
        };
        let Some(rate) = rate else {
            return Err(AppError::tc(TcError::BurstWithoutRate {
                host: host.to_owned(),
                direction,
            }));
        };
        // The advised minimum burst is the maximum rate / 8 * 10ms.
        if burst.bits().saturating_mul(800) < rate.bits() {
            tracing::warn!(
                "The advised minimum for the maximum {} burst is the maximum {} / 800. This \
                 would be {} for host {}, which is larger than the given burst {}. Ignoring at \
                 your risk.",
                direction,
                direction,
                rate.bits().checked_div(800).unwrap_or(0),
                host,
                burst.text()
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    /// The interface to shape; only set once [`check`] has run.
    ///
    /// [`check`]: TcSettings::check
    #[must_use]
    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or("eth0")
    }

    #[must_use]
    pub const fn down(&self) -> Option<&Speed> {
        self.down.as_ref()
    }

    #[must_use]
    pub const fn down_burst(&self) -> Option<&Speed> {
        self.down_burst.as_ref()
    }

    #[must_use]
    pub const fn up(&self) -> Option<&Speed> {
        self.up.as_ref()
    }

    #[must_use]
    pub const fn up_burst(&self) -> Option<&Speed> {
        self.up_burst.as_ref()
    }

    #[must_use]
    pub const fn loss(&self) -> Option<&Chance> {
        self.loss.as_ref()
    }

    #[must_use]
    pub const fn corruption(&self) -> Option<&Chance> {
        self.corruption.as_ref()
    }

    #[must_use]
    pub const fn duplication(&self) -> Option<&Chance> {
        self.duplication.as_ref()
    }

    #[must_use]
    pub const fn delay_ms(&self) -> u32 {
        self.delay_ms
    }

    #[must_use]
    pub const fn jitter_ms(&self) -> u32 {
        self.jitter_ms
    }

    fn wants_inbound(&self) -> bool {
        self.down.is_some()
            || self.loss.as_ref().is_some_and(|c| !c.is_zero())
            || self.corruption.as_ref().is_some_and(|c| !c.is_zero())
            || self.duplication.as_ref().is_some_and(|c| !c.is_zero())
    }

    fn wants_outbound(&self) -> bool {
        self.up.is_some() || self.delay_ms != 0
    }
}

/// How far shaping reaches in one direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Restriction {
    /// No shaping in this direction.
    Off,
    /// Shaping limited to these ports.
    Ports(BTreeSet<u16>),
    /// Shaping applied to all traffic from or to the other hosts.
    AllTraffic,
}

impl Restriction {
    /// Widen port-restricted shaping to all traffic. No shaping stays
    /// no shaping.
    pub fn escalate(&mut self) {
        if matches!(self, Self::Ports(_)) {
            *self = Self::AllTraffic;
        }
    }

    #[must_use]
    pub const fn is_ports(&self) -> bool {
        matches!(self, Self::Ports(_))
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// The negotiated shaping for one host.
#[derive(Clone, Debug)]
pub struct TcPlan {
    pub inbound: Restriction,
    pub outbound: Restriction,
    pub protocol: String,
}

impl TcPlan {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.inbound.is_active() || self.outbound.is_active()
    }
}

/// What one client contributes to the restriction planning.
pub struct ClientTraffic {
    pub client: String,
    pub protocol: String,
    pub inbound_ports: Vec<u16>,
    pub outbound_ports: Vec<u16>,
}

/// Work out the restrictions for one host from its settings and the
/// clients that will run on it. Returns `None` when the host does not
/// use traffic control.
///
/// # Errors
///
/// Fails when the host is the loopback host.
pub fn plan_restrictions(
    settings: &TcSettings,
    host: &str,
    subnet: &str,
    clients: &[ClientTraffic],
) -> AppResult<Option<TcPlan>> {
    if settings.module().is_none() {
        return Ok(None);
    }
    if subnet == "127.0.0.1" || subnet == "localhost" {
        return Err(AppError::tc(TcError::Loopback {
            host: host.to_owned(),
        }));
    }
    let mut inbound = if settings.wants_inbound() {
        Restriction::Ports(BTreeSet::new())
    } else {
        Restriction::Off
    };
    let mut outbound = if settings.wants_outbound() {
        Restriction::Ports(BTreeSet::new())
    } else {
        Restriction::Off
    };
    let mut protocol = String::new();
    for client in clients {
        if protocol.is_empty() {
            protocol.clone_from(&client.protocol);
        } else if protocol != client.protocol {
            tracing::warn!(
                "Restricted traffic control using multiple protocols is not supported. Falling \
                 back to unrestricted traffic control on host {}.",
                host
            );
            inbound.escalate();
            outbound.escalate();
        }
        if let Restriction::Ports(ports) = &mut inbound {
            if client.inbound_ports.is_empty() {
                tracing::warn!(
                    "Client {} can't have restricted inbound traffic control. Falling back to \
                     unrestricted inbound traffic control on host {}.",
                    client.client,
                    host
                );
                inbound = Restriction::AllTraffic;
            } else {
                ports.extend(client.inbound_ports.iter().copied());
            }
        }
        if let Restriction::Ports(ports) = &mut outbound {
            if client.outbound_ports.is_empty() {
                tracing::warn!(
                    "Client {} can't have restricted outbound traffic control. Falling back to \
                     unrestricted outbound traffic control on host {}.",
                    client.client,
                    host
                );
                outbound = Restriction::AllTraffic;
            } else {
                ports.extend(client.outbound_ports.iter().copied());
            }
        }
        if !inbound.is_ports() && !outbound.is_ports() {
            break;
        }
    }
    if inbound == Restriction::AllTraffic {
        unrestricted_warning(host, "inbound ");
    }
    if outbound == Restriction::AllTraffic {
        unrestricted_warning(host, "outbound ");
    }
    Ok(Some(TcPlan {
        inbound,
        outbound,
        protocol,
    }))
}

fn unrestricted_warning(host: &str, direction: &str) {
    tracing::warn!(
        "Using unrestricted traffic control for {}traffic on host {}. If the commanding host \
         (i.e. your terminal) is also part of the nodes you configured for testing, then this \
         WILL cause trouble.",
        direction,
        host
    );
}

fn fallback_warning(host: &str, direction: &str) {
    tracing::warn!(
        "Host {} could not initiate restricted {}traffic control, falling back to unrestricted \
         traffic control.",
        host,
        direction
    );
    unrestricted_warning(host, direction);
}

/// One way of shaping traffic on a host.
#[async_trait]
pub trait TrafficShaper: Send + Sync {
    /// The subtype name as used in scenario files.
    fn kind(&self) -> &'static str;

    /// Probe whether the host supports this shaping under the given
    /// plan. A refusal is reported as `Ok(false)` with the reason
    /// logged; errors are real communication failures.
    ///
    /// # Errors
    ///
    /// Fails when the host cannot be reached.
    async fn check(&self, host: &Host, plan: &TcPlan) -> AppResult<bool>;

    /// Install the shaping on the host. `other_subnets` holds the
    /// subnets of the other hosts in the scenario, for plans that
    /// shape all traffic.
    ///
    /// # Errors
    ///
    /// Fails when installation does not come up cleanly.
    async fn install(&self, host: &Host, plan: &TcPlan, other_subnets: &[String]) -> AppResult<()>;

    /// Best-effort removal of the shaping from the host.
    async fn remove(&self, host: &Host);
}

/// Check a plan against the host's actual capabilities, widening it
/// step by step when the host refuses: unrestricted inbound first,
/// then unrestricted outbound, then both.
///
/// # Errors
///
/// Fails when no widening makes the host accept, or the host cannot be
/// reached at all.
pub async fn negotiate(
    shaper: &dyn TrafficShaper,
    host: &Host,
    mut plan: TcPlan,
) -> AppResult<TcPlan> {
    let refusal = || {
        AppError::tc(TcError::CheckFailed {
            host: host.name().to_owned(),
        })
    };
    if shaper.check(host, &plan).await? {
        return Ok(plan);
    }
    if plan.inbound.is_ports() {
        let restricted_inbound = plan.inbound.clone();
        plan.inbound = Restriction::AllTraffic;
        if shaper.check(host, &plan).await? {
            fallback_warning(host.name(), "inbound ");
            return Ok(plan);
        }
        if !plan.outbound.is_ports() {
            return Err(refusal());
        }
        plan.inbound = restricted_inbound;
        plan.outbound = Restriction::AllTraffic;
        if shaper.check(host, &plan).await? {
            fallback_warning(host.name(), "outbound ");
            return Ok(plan);
        }
        plan.inbound = Restriction::AllTraffic;
        if shaper.check(host, &plan).await? {
            fallback_warning(host.name(), "");
            return Ok(plan);
        }
        return Err(refusal());
    }
    if plan.outbound.is_ports() {
        plan.outbound = Restriction::AllTraffic;
        if shaper.check(host, &plan).await? {
            fallback_warning(host.name(), "outbound ");
            return Ok(plan);
        }
        return Err(refusal());
    }
    Err(refusal())
}
