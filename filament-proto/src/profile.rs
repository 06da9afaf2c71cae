#[allow(clippy::all)]
pub mod pprof {
    include!(concat!(env!("OUT_DIR"), "/perftools.profiles.rs"));
}

use anyhow::{anyhow, Result};

/// Run some validations to ensure that a profile is semantically correct.
/// Mostly useful in tests, where a malformed profile would otherwise only
/// show up once a server rejects it.
pub fn validate(profile: &pprof::Profile) -> Result<()> {
    if profile.string_table.first().map(String::as_str) != Some("") {
        return Err(anyhow!("string_table[0] must be the empty string"));
    }

    let string = |idx: i64| -> Result<&str> {
        profile
            .string_table
            .get(idx as usize)
            .map(String::as_str)
            .ok_or(anyhow!("string with index {} not found", idx))
    };

    for mapping in &profile.mapping {
        if mapping.id == 0 {
            return Err(anyhow!("found a null mapping (id=0)"));
        }
        string(mapping.filename)?;
        string(mapping.build_id)?;
    }

    for location in &profile.location {
        if location.id == 0 {
            return Err(anyhow!("found a null location (id=0)"));
        }
        if location.mapping_id != 0
            && !profile.mapping.iter().any(|m| m.id == location.mapping_id)
        {
            return Err(anyhow!("mapping with id {} not found", location.mapping_id));
        }
        for line in &location.line {
            let function = profile
                .function
                .iter()
                .find(|f| f.id == line.function_id)
                .ok_or(anyhow!("function with id {} not found", line.function_id))?;
            string(function.name)?;
        }
    }

    for sample in &profile.sample {
        for location_id in &sample.location_id {
            if *location_id == 0 {
                return Err(anyhow!("found a null location (id=0)"));
            }
            if !profile.location.iter().any(|l| l.id == *location_id) {
                return Err(anyhow!("location with id {} not found", location_id));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    // Cheat sheet:
    // - decode protobuf: `protoc --decode perftools.profiles.Profile src/protos/profile.proto < profile.pb`
    // - validate it: (in pprof's codebase) `go tool pprof profile.pb`
    // - print it: `go tool pprof -raw profile.pb`
    use super::*;

    #[test]
    fn validate_flags_dangling_references() {
        let mut profile = pprof::Profile {
            string_table: vec!["".into(), "main".into()],
            ..Default::default()
        };
        assert!(validate(&profile).is_ok());

        profile.sample.push(pprof::Sample {
            location_id: vec![1],
            value: vec![1],
            label: vec![],
        });
        assert!(validate(&profile).is_err());

        profile.location.push(pprof::Location {
            id: 1,
            mapping_id: 7,
            address: 0x1234,
            line: vec![],
            is_folded: false,
        });
        assert!(validate(&profile).is_err());

        profile.mapping.push(pprof::Mapping {
            id: 7,
            filename: 1,
            ..Default::default()
        });
        assert!(validate(&profile).is_ok());
    }

    #[test]
    fn validate_requires_empty_first_string() {
        let profile = pprof::Profile {
            string_table: vec!["not-empty".into()],
            ..Default::default()
        };
        assert!(validate(&profile).is_err());
    }
}
