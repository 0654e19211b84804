//! Traffic shaping with the Linux netem/tbf/htb qdiscs.
//!
//! Inbound shaping redirects traffic to the ifb0 device through an
//! ingress qdisc and applies netem (loss, corruption, duplication) and
//! tbf (rate capping) there. Outbound shaping stacks an htb rate class
//! under a netem delay qdisc on the interface itself. Everything runs
//! through `sudo tc`, which must work without a password; the
//! [`check`] probes verify that before anything is touched.
//!
//! [`check`]: NetemShaper::check

use std::fmt::Write as _;

use async_trait::async_trait;

use crate::error::{AppError, AppResult, TcError};
use crate::host::{Host, Reuse};
use crate::tc::{Restriction, TcPlan, TcSettings, TrafficShaper};

/// Assumed speed of the NIC; used as the rate of the unshaped classes.
/// Too high is harmless, too low throttles unshaped traffic.
const NIC_MAX: &str = "1024mbit";

const TC: &str = "`which sudo` -n `which tc`";
const DBG: &str = "> \"$dbgfile\"";
const DBG2: &str = "2> \"$dbgfile\"";

pub struct NetemShaper;

#[must_use]
pub fn factory() -> Box<dyn TrafficShaper> {
    Box::new(NetemShaper)
}

/// Run a probe command and report whether it succeeded.
async fn probe(host: &Host, command: &str) -> AppResult<bool> {
    let answer = host
        .send_command(
            &format!("{command} && echo \"OK\" || echo \"NO\""),
            &Reuse::Default,
        )
        .await?;
    Ok(answer.lines().last() == Some("OK"))
}

fn refuse(host: &Host, reason: &str) -> bool {
    tracing::warn!("tc:netem :: Problem on host {}. {}", host.name(), reason);
    false
}

/// Build the one-shot installation script for a plan. The commands are
/// chained with `&&` into a debug file dance: reaching the end prints
/// OK, any earlier failure falls through to the cleanup tail which
/// dumps the debug file.
fn install_script(
    settings: &TcSettings,
    plan: &TcPlan,
    other_subnets: &[String],
) -> AppResult<String> {
    let iface = settings.interface();
    let mut cmds = String::new();
    cmds.push_str(
        "dbgfile=`mktemp`; if [ ! -f \"$dbgfile\" ]; then echo \"Could not create temporary \
         file for debug.\"; exit; fi; ",
    );
    write!(cmds, "echo \"Cleaning before starting\" {DBG}; ")?;
    if plan.inbound.is_active() {
        write!(cmds, "{TC} qdisc del dev {iface} ingress 2> /dev/null; ")?;
        write!(cmds, "{TC} qdisc del dev ifb0 root 2> /dev/null; ")?;
    }
    if plan.outbound.is_active() {
        write!(cmds, "{TC} qdisc del dev {iface} root 2> /dev/null; ")?;
    }
    write!(cmds, "echo \"Cleanup done, setting up tc\" {DBG} ")?;
    if plan.inbound.is_active() {
        write!(cmds, "&& echo \"INBOUND TRAFFIC\" {DBG} ")?;
        write!(cmds, "&& echo \"Adding ingress\" {DBG} ")?;
        write!(cmds, "&& {TC} qdisc add dev {iface} ingress {DBG2} ")?;
        match &plan.inbound {
            Restriction::Ports(ports) => {
                for port in ports {
                    write!(
                        cmds,
                        "&& echo \"Redirecting destination port {port} to ifb\" {DBG} "
                    )?;
                    write!(
                        cmds,
                        "&& {TC} filter add dev {iface} parent ffff: protocol ip prio 1 u32 \
                         match ip dport {port} 0xffff flowid 1:1 action mirred egress redirect \
                         dev ifb0 {DBG2} "
                    )?;
                }
            }
            Restriction::AllTraffic => {
                for subnet in other_subnets {
                    write!(
                        cmds,
                        "&& echo \"Redirecting source host {subnet} to ifb\" {DBG} "
                    )?;
                    write!(
                        cmds,
                        "&& {TC} filter add dev {iface} parent ffff: protocol ip prio 1 u32 \
                         match ip src {subnet} flowid 1:1 action mirred egress redirect dev \
                         ifb0 {DBG2} "
                    )?;
                }
            }
            Restriction::Off => {}
        }
        let mut netem_params = String::new();
        if let Some(loss) = settings.loss() {
            if !loss.is_zero() {
                write!(netem_params, "loss {}% ", loss.text())?;
            }
        }
        if let Some(corruption) = settings.corruption() {
            if !corruption.is_zero() {
                write!(netem_params, "corrupt {}% ", corruption.text())?;
            }
        }
        if let Some(duplication) = settings.duplication() {
            if !duplication.is_zero() {
                write!(netem_params, "duplicate {}% ", duplication.text())?;
            }
        }
        let has_netem = !netem_params.is_empty();
        if has_netem {
            write!(
                cmds,
                "&& echo \"Setting up netem using options {netem_params}\" {DBG} "
            )?;
            write!(
                cmds,
                "&& {TC} qdisc add dev ifb0 root handle 1: netem {netem_params}{DBG2} "
            )?;
        } else {
            write!(cmds, "&& echo \"Not using netem module\" {DBG} ")?;
        }
        if let Some(down) = settings.down() {
            let burst = settings.down_burst().unwrap_or(down);
            let tbf_params = format!("rate {} burst {} ", down.text(), burst.text());
            if has_netem {
                write!(
                    cmds,
                    "&& echo \"Adding tbf to ifb0 under netem using options {tbf_params}latency \
                     50ms\" {DBG} "
                )?;
                write!(
                    cmds,
                    "&& {TC} qdisc add dev ifb0 parent 1:1 handle 10: tbf {tbf_params}latency \
                     50ms {DBG2} "
                )?;
            } else {
                write!(
                    cmds,
                    "&& echo \"Adding tbf to ifb0 using options {tbf_params}latency 50ms\" {DBG} "
                )?;
                write!(
                    cmds,
                    "&& {TC} qdisc add dev ifb0 root handle 10: tbf {tbf_params}latency 50ms \
                     {DBG2} "
                )?;
            }
        }
    }
    if plan.outbound.is_active() {
        write!(cmds, "&& echo \"OUTBOUND TRAFFIC\" {DBG} ")?;
        let has_netem = settings.delay_ms() != 0;
        if has_netem {
            let delay = settings.delay_ms();
            let jitter = if settings.jitter_ms() == 0 {
                String::new()
            } else {
                format!(" {}ms", settings.jitter_ms())
            };
            write!(
                cmds,
                "&& echo \"Adding netem under controlled class with delay {delay}ms\" {DBG} "
            )?;
            write!(
                cmds,
                "&& {TC} qdisc add dev {iface} root handle 51: netem delay {delay}ms{jitter} \
                 {DBG2} "
            )?;
        } else {
            write!(
                cmds,
                "&& echo \"No netem needed: no delay to be introduced\" {DBG} "
            )?;
        }
        if has_netem {
            write!(cmds, "&& echo \"Setting up htb under netem\" {DBG} ")?;
            write!(
                cmds,
                "&& {TC} qdisc add dev {iface} parent 51: handle 50: htb default 11 {DBG2} "
            )?;
        } else {
            write!(cmds, "&& echo \"Setting up htb\" {DBG} ")?;
            write!(
                cmds,
                "&& {TC} qdisc add dev {iface} root handle 50: htb default 11 {DBG2} "
            )?;
        }
        write!(
            cmds,
            "&& echo \"Adding base class to htb (rate {NIC_MAX})\" {DBG} "
        )?;
        write!(
            cmds,
            "&& {TC} class add dev {iface} parent 50: classid 50:1 htb rate {NIC_MAX} burst \
             {NIC_MAX} {DBG2} "
        )?;
        if let Some(up) = settings.up() {
            let burst = settings.up_burst().unwrap_or(up);
            write!(
                cmds,
                "&& echo \"Setting up controlled class (rate {}, burst {})\" {DBG} ",
                up.text(),
                burst.text()
            )?;
            write!(
                cmds,
                "&& {TC} class add dev {iface} parent 50: classid 50:10 htb rate {} burst {} \
                 {DBG2} ",
                up.text(),
                burst.text()
            )?;
        } else {
            write!(
                cmds,
                "&& echo \"Setting up controlled class without control (just pass traffic on to \
                 netem)\" {DBG} "
            )?;
            write!(
                cmds,
                "&& {TC} class add dev {iface} parent 50: classid 50:10 htb rate {NIC_MAX} burst \
                 {NIC_MAX} {DBG2} "
            )?;
        }
        write!(
            cmds,
            "&& echo \"Setting up default class (rate {NIC_MAX})\" {DBG} "
        )?;
        write!(
            cmds,
            "&& {TC} class add dev {iface} parent 50: classid 50:11 htb rate {NIC_MAX} burst \
             {NIC_MAX} {DBG2} "
        )?;
        match &plan.outbound {
            Restriction::Ports(ports) => {
                for port in ports {
                    write!(
                        cmds,
                        "&& echo \"Filtering source port {port} to controlled class\" {DBG} "
                    )?;
                    write!(
                        cmds,
                        "&& {TC} filter add dev {iface} parent 50: protocol ip prio 1 u32 match \
                         ip sport {port} 0xffff flowid 50:10 {DBG2} "
                    )?;
                }
            }
            Restriction::AllTraffic => {
                for subnet in other_subnets {
                    write!(
                        cmds,
                        "&& echo \"Filtering destination host {subnet} to controlled class\" \
                         {DBG} "
                    )?;
                    write!(
                        cmds,
                        "&& {TC} filter add dev {iface} parent 50: protocol ip prio 1 u32 match \
                         ip dst {subnet} flowid 50:10 {DBG2} "
                    )?;
                }
            }
            Restriction::Off => {}
        }
    }
    cmds.push_str("&& rm -f \"$dbgfile\" && echo \"OK\" && exit; ");
    // Reached only when part of the && chain failed: tear down and
    // surface the debug log.
    write!(
        cmds,
        "{TC} qdisc del dev {iface} root 2> /dev/null; {TC} qdisc del dev {iface} ingress 2> \
         /dev/null; cat \"$dbgfile\"; rm -f \"$dbgfile\""
    )?;
    Ok(cmds)
}

#[async_trait]
impl TrafficShaper for NetemShaper {
    fn kind(&self) -> &'static str {
        "netem"
    }

    async fn check(&self, host: &Host, plan: &TcPlan) -> AppResult<bool> {
        if !probe(host, "which tc > /dev/null").await? {
            return Ok(refuse(host, "tc is not installed"));
        }
        if !probe(host, "which sudo > /dev/null").await? {
            return Ok(refuse(host, "sudo is not installed"));
        }
        if !probe(host, "`which sudo` -n -l `which tc` >/dev/null 2>/dev/null").await? {
            return Ok(refuse(host, "Can't call sudo tc without password"));
        }
        if !probe(host, "which modprobe > /dev/null").await? {
            return Ok(refuse(
                host,
                "modprobe not found; this is used for checking and loading required kernel \
                 modules",
            ));
        }
        if !probe(host, "`which modprobe` -n sch_netem 2>/dev/null").await? {
            return Ok(refuse(host, "netem module not found"));
        }
        if !probe(host, "`which modprobe` sch_netem 2>/dev/null").await?
            && !probe(
                host,
                "`which sudo` -n `which modprobe` sch_netem > /dev/null 2>/dev/null",
            )
            .await?
        {
            return Ok(refuse(
                host,
                "netem support available, but the module could not be loaded. Do you have the \
                 right to use sudo modprobe without a password? Please load the module manually \
                 and try again.",
            ));
        }
        if plan.inbound.is_active() {
            if !probe(host, "`which modprobe` -n ifb 2>/dev/null").await? {
                return Ok(refuse(
                    host,
                    "IFB module not found, this is required for inbound traffic control",
                ));
            }
            if !probe(host, "`which modprobe` ifb 2>/dev/null").await?
                && !probe(
                    host,
                    "`which sudo` -n `which modprobe` ifb > /dev/null 2>/dev/null",
                )
                .await?
            {
                return Ok(refuse(
                    host,
                    "IFB support available, but the module could not be loaded. Do you have the \
                     right to use sudo modprobe without a password? Please load the module \
                     manually and try again.",
                ));
            }
        }
        if !probe(host, "which ifconfig > /dev/null").await? {
            return Ok(refuse(
                host,
                "ifconfig not found; this is used for checking the availability of the \
                 requested interface",
            ));
        }
        let iface = host.tc_settings().interface();
        if !probe(
            host,
            &format!("`which ifconfig` | grep -E \"^{iface}[[:space:]]\" > /dev/null"),
        )
        .await?
        {
            return Ok(refuse(
                host,
                &format!("{iface} does not seem to be a valid interface on this host"),
            ));
        }
        if plan.inbound.is_active()
            && !probe(
                host,
                "`which ifconfig` | grep -E \"^ifb0[[:space:]]\" > /dev/null",
            )
            .await?
            && !probe(
                host,
                "`which sudo` `which ip` link set dev ifb0 up && `which ifconfig` | grep -E \
                 \"^ifb0[[:space:]]\" > /dev/null",
            )
            .await?
        {
            return Ok(refuse(
                host,
                "IFB support is available and the module is loaded, but it was not possible to \
                 get the link up. Please enable it manually, e.g. using \"sudo ip link set dev \
                 ifb0 up\".",
            ));
        }
        Ok(true)
    }

    async fn install(&self, host: &Host, plan: &TcPlan, other_subnets: &[String]) -> AppResult<()> {
        let script = install_script(host.tc_settings(), plan, other_subnets)?;
        // Run in a background subshell so a restriction that would cut
        // the command connection cannot interrupt the installation.
        let answer = host
            .send_command(&format!("( {script} ) &\nwait"), &Reuse::Default)
            .await?;
        if answer.lines().last() != Some("OK") {
            return Err(AppError::tc(TcError::InstallFailed {
                host: host.name().to_owned(),
                output: answer,
            }));
        }
        Ok(())
    }

    async fn remove(&self, host: &Host) {
        let iface = host.tc_settings().interface().to_owned();
        let teardown = [
            format!("{TC} qdisc del dev {iface} root 2> /dev/null"),
            format!("{TC} qdisc del dev {iface} ingress 2> /dev/null"),
            format!("{TC} qdisc del dev ifb0 root 2> /dev/null"),
        ];
        for command in teardown {
            if let Err(err) = host.send_command(&command, &Reuse::Default).await {
                tracing::debug!(
                    "Removing traffic control from host {} failed: {}",
                    host.name(),
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn settings(pairs: &[(&str, &str)]) -> AppResult<TcSettings> {
        let mut settings = TcSettings::new();
        for (key, value) in pairs {
            settings.parse_setting(key, value)?;
        }
        settings.check("node1")?;
        Ok(settings)
    }

    #[test]
    fn port_restricted_script_filters_each_port() -> AppResult<()> {
        let settings = settings(&[("tc", "netem"), ("tc_down", "10mbit"), ("tc_up", "1mbit")])?;
        let plan = TcPlan {
            inbound: Restriction::Ports(BTreeSet::from([6881, 6882])),
            outbound: Restriction::Ports(BTreeSet::from([6881])),
            protocol: "tcp".to_owned(),
        };
        let script = install_script(&settings, &plan, &[])?;
        if !script.contains("match ip dport 6881 0xffff")
            || !script.contains("match ip dport 6882 0xffff")
        {
            return Err(AppError::tc("Inbound port filters missing"));
        }
        if !script.contains("match ip sport 6881 0xffff") {
            return Err(AppError::tc("Outbound port filter missing"));
        }
        if !script.contains("tbf rate 10mbit burst 10mbit latency 50ms") {
            return Err(AppError::tc("Download cap missing or burst not defaulted"));
        }
        if !script.contains("classid 50:10 htb rate 1mbit burst 1mbit") {
            return Err(AppError::tc("Upload class missing"));
        }
        if !script.contains("classid 50:11") {
            return Err(AppError::tc("Default htb class missing"));
        }
        if !script.ends_with("rm -f \"$dbgfile\"") {
            return Err(AppError::tc("Failure tail missing"));
        }
        Ok(())
    }

    #[test]
    fn unrestricted_script_matches_other_subnets() -> AppResult<()> {
        let settings = settings(&[("tc", "netem"), ("tc_loss", "5"), ("tc_delay", "100")])?;
        let plan = TcPlan {
            inbound: Restriction::AllTraffic,
            outbound: Restriction::AllTraffic,
            protocol: String::new(),
        };
        let subnets = vec!["10.0.1.0/24".to_owned(), "10.0.2.0/24".to_owned()];
        let script = install_script(&settings, &plan, &subnets)?;
        if !script.contains("match ip src 10.0.1.0/24")
            || !script.contains("match ip src 10.0.2.0/24")
        {
            return Err(AppError::tc("Inbound subnet redirects missing"));
        }
        if !script.contains("match ip dst 10.0.1.0/24") {
            return Err(AppError::tc("Outbound subnet filter missing"));
        }
        if !script.contains("netem loss 5% ") {
            return Err(AppError::tc("Loss parameter missing"));
        }
        if !script.contains("netem delay 100ms ") {
            return Err(AppError::tc("Delay qdisc missing"));
        }
        Ok(())
    }

    #[test]
    fn jitter_rides_along_with_delay() -> AppResult<()> {
        let settings = settings(&[
            ("tc", "netem"),
            ("tc_delay", "100"),
            ("tc_jitter", "20"),
            ("tc_up", "1mbit"),
        ])?;
        let plan = TcPlan {
            inbound: Restriction::Off,
            outbound: Restriction::Ports(BTreeSet::from([7000])),
            protocol: "tcp".to_owned(),
        };
        let script = install_script(&settings, &plan, &[])?;
        if !script.contains("netem delay 100ms 20ms") {
            return Err(AppError::tc("Jitter missing from delay qdisc"));
        }
        if script.contains("INBOUND TRAFFIC") {
            return Err(AppError::tc("Inbound section present despite Off"));
        }
        Ok(())
    }
}
