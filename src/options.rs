//! Command-line configuration. `init` recognizes and strips the runtime's
//! own flags from the argument list it is given; everything else is left in
//! place for the application's own parser.

use crate::architecture::cpu;
use crate::runtime::lifecycle::Error;

const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub(crate) struct Options {
    pub min_num_cores: u32,
    pub max_num_cores: u32,
    pub stack_size: usize,
    pub disable_load_estimation: bool,
    pub enable_arbiter: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            min_num_cores: 1,
            max_num_cores: cpu::num_cpus().get() as u32,
            stack_size: DEFAULT_STACK_SIZE,
            disable_load_estimation: false,
            enable_arbiter: false,
        }
    }
}

/// Parses the recognized flags out of `argv`, removing them; unknown
/// arguments pass through untouched. Both `--flag value` and `--flag=value`
/// spellings are accepted.
pub(crate) fn parse_and_strip(argv: &mut Vec<String>) -> Result<Options, Error> {
    let mut options = Options::default();
    let mut kept = Vec::with_capacity(argv.len());
    let mut arguments = std::mem::take(argv).into_iter();
    while let Some(argument) = arguments.next() {
        let (flag, inline_value) = match argument.split_once('=') {
            Some((flag, value)) => (flag.to_owned(), Some(value.to_owned())),
            None => (argument.clone(), None),
        };
        let mut take_value = || -> Result<String, Error> {
            match inline_value.clone() {
                Some(value) => Ok(value),
                None => arguments
                    .next()
                    .ok_or_else(|| Error::InvalidOption(format!("{flag} requires a value"))),
            }
        };
        match flag.as_str() {
            "--minNumCores" => options.min_num_cores = parse_number(&flag, &take_value()?)?,
            "--maxNumCores" => options.max_num_cores = parse_number(&flag, &take_value()?)?,
            "--stackSize" => {
                options.stack_size = parse_number::<usize>(&flag, &take_value()?)?;
            }
            "--disableLoadEstimation" => options.disable_load_estimation = true,
            "--enableArbiter" => {
                options.enable_arbiter = match take_value()?.as_str() {
                    "0" => false,
                    "1" => true,
                    other => {
                        return Err(Error::InvalidOption(format!(
                            "{flag} takes 0 or 1, got {other}"
                        )))
                    }
                }
            }
            _ => kept.push(argument),
        }
    }
    *argv = kept;

    if options.min_num_cores == 0 {
        return Err(Error::InvalidOption("--minNumCores must be at least 1".into()));
    }
    if options.max_num_cores < options.min_num_cores {
        return Err(Error::InvalidOption(
            "--maxNumCores must be at least --minNumCores".into(),
        ));
    }
    Ok(options)
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::InvalidOption(format!("{flag} got a malformed value: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn recognized_flags_are_stripped() {
        let mut argv = args(&[
            "--appFlag",
            "--minNumCores",
            "2",
            "--maxNumCores=4",
            "--stackSize",
            "131072",
            "--disableLoadEstimation",
            "appArg",
        ]);
        let options = parse_and_strip(&mut argv).unwrap();
        assert_eq!(options.min_num_cores, 2);
        assert_eq!(options.max_num_cores, 4);
        assert_eq!(options.stack_size, 131072);
        assert!(options.disable_load_estimation);
        assert!(!options.enable_arbiter);
        assert_eq!(argv, args(&["--appFlag", "appArg"]));
    }

    #[test]
    fn unknown_flags_pass_through_in_order() {
        let mut argv = args(&["-v", "--other", "7", "--enableArbiter", "0"]);
        let options = parse_and_strip(&mut argv).unwrap();
        assert!(!options.enable_arbiter);
        assert_eq!(argv, args(&["-v", "--other", "7"]));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut argv = args(&["--minNumCores", "two"]);
        assert!(parse_and_strip(&mut argv).is_err());

        let mut argv = args(&["--maxNumCores"]);
        assert!(parse_and_strip(&mut argv).is_err());

        let mut argv = args(&["--minNumCores", "4", "--maxNumCores", "2"]);
        assert!(parse_and_strip(&mut argv).is_err());

        let mut argv = args(&["--enableArbiter", "yes"]);
        assert!(parse_and_strip(&mut argv).is_err());
    }
}
