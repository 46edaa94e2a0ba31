//! The `marlin` flavor: identified from a `FIRMWARE_NAME:Marlin …` report.
//! Builds on [`super::generic`]'s matchers, overriding only what Marlin
//! actually does differently (checksum policy, emergency-stop framing).

use std::collections::BTreeMap;

use crate::command::to_command;
use crate::flavor::{generic, Emitters, Flavor, Policy};

fn identifier(firmware_name: &str, _info: &BTreeMap<String, String>) -> bool {
    firmware_name.to_ascii_lowercase().contains("marlin")
}

fn emit_emergency_stop() -> crate::command::Command {
    // Marlin treats M112 identically to the generic case; kept as its own
    // function (rather than reusing generic's) so a future Marlin-specific
    // framing change has somewhere to live.
    to_command("M112", None, vec![])
}

pub fn flavor() -> Flavor {
    let base = generic::flavor();

    Flavor {
        key: "marlin",
        identifier,
        messages: base.messages,
        errors: base.errors,
        emitters: Emitters { emergency_stop: emit_emergency_stop, ..base.emitters },
        policy: Policy {
            // Marlin acks unknown commands, so hosts sending it uncommon
            // gcodes expect an `ok` even for lines it doesn't recognize.
            unknown_requires_ack: true,
            ..base.policy
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifies_marlin_by_name() {
        let f = flavor();
        assert!((f.identifier)("Marlin 2.1.2", &BTreeMap::new()));
        assert!(!(f.identifier)("Repetier-Firmware", &BTreeMap::new()));
    }
}
