//! `powermon probe`: check which power sources work on this machine.

use std::path::Path;
use std::time::Instant;

use powermon_core::sources::rapl::POWERCAP_ROOT;
use powermon_core::{
    CpuPowerState, EnergyCounterSource, IpmiConfig, IpmiPowerSource, PlatformPowerSource,
    RaplEnergySource, detect_machine_info, discover_zones, is_privileged,
};

pub fn run(ipmi: &IpmiConfig, json: bool) -> anyhow::Result<()> {
    let mut bmc = IpmiPowerSource::new(ipmi);
    let t0 = Instant::now();
    let watts = bmc.read_watts();
    let ipmi_ms = t0.elapsed().as_secs_f64() * 1000.0;

    let mut rapl = RaplEnergySource::detect();
    let energy = rapl.read_microjoules();
    let bound = rapl.rollover_bound();
    let zones = discover_zones(Path::new(POWERCAP_ROOT));

    let machine = detect_machine_info();
    let cpu = CpuPowerState::capture();
    let privileged = is_privileged();

    if json {
        let report = serde_json::json!({
            "machine": machine,
            "privileged": privileged,
            "ipmi": {
                "command": bmc.info().description,
                "watts": watts,
                "query_ms": ipmi_ms,
            },
            "rapl": {
                "energy_file": rapl.energy_path(),
                "energy_uj": energy,
                "max_energy_range_uj": bound.max_uj,
                "range_origin": bound.origin.to_string(),
                "zones": zones,
            },
            "cpu_state": cpu,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Machine: {} ({}, {} cores)", machine.chip, machine.arch, machine.cores);
        println!("  Running as root: {}", if privileged { "yes" } else { "no" });
        println!();

        println!("IPMI (BMC platform power)");
        println!("  Command: {}", bmc.info().description);
        match watts {
            Some(w) => println!("  Reading: {w} W ({ipmi_ms:.0} ms)"),
            None => println!("  Reading: unavailable"),
        }
        println!();

        println!("RAPL (package energy)");
        println!("  Counter: {}", rapl.energy_path().display());
        match energy {
            Some(uj) => println!("  Reading: {uj} uJ"),
            None => println!("  Reading: unavailable"),
        }
        println!("  Range:   {} uJ ({})", bound.max_uj, bound.origin);
        if zones.is_empty() {
            println!("  Zones:   none under {POWERCAP_ROOT}");
        }
        for z in &zones {
            println!(
                "  Zone:    {:<12} {}{}",
                z.name,
                z.path.display(),
                if z.readable { "" } else { "  (not readable)" }
            );
        }
        println!();

        println!("CPU power state");
        println!(
            "  Driver:    {}",
            cpu.scaling_driver.as_deref().unwrap_or("unknown")
        );
        println!("  Governors: {}", cpu.governors.join(", "));
        if let (Some(lo), Some(hi)) = (cpu.cur_freq_khz_min, cpu.cur_freq_khz_max) {
            println!("  Freq:      {lo}-{hi} kHz across {} CPUs", cpu.cpus_sampled);
        }
        println!("  Disabled idle states: {}", cpu.disabled_idle_states);
        if let Some(iso) = &cpu.isolated {
            println!("  Isolated:  {iso}");
        }
    }

    if watts.is_none() && energy.is_none() {
        anyhow::bail!("neither IPMI nor RAPL could be read");
    }
    Ok(())
}
