use anyhow::{bail, Context as _, Error};
use masking::UnanalyzedPolicy;
use pktmask::{
    batch::{discover_inputs, run_batch},
    config::{BatchOptions, MaskOptions},
    pipeline::{LogSink, MaskStage, Pipeline, Stage},
    report::RunReport,
};
use std::{
    fs,
    path::PathBuf,
    process,
    sync::atomic::AtomicBool,
    time::Duration,
};
use structopt::StructOpt;

/// Masks TLS payload bytes in capture files while preserving frame counts,
/// ordering, timestamps, headers, lengths, and checksum validity.
#[derive(Debug, StructOpt)]
#[structopt(name = "pktmask")]
struct CliArgs {
    /// Capture files or directories containing captures
    #[structopt(name = "INPUTS", required = true, parse(from_os_str))]
    inputs: Vec<PathBuf>,

    /// Directory receiving the masked captures
    #[structopt(short = "o", long = "output-dir", parse(from_os_str))]
    output_dir: PathBuf,

    /// Skip the external reassembly preprocessing
    #[structopt(long = "no-reassembly")]
    no_reassembly: bool,

    /// External decoder executable used for reassembly
    #[structopt(long = "decoder", default_value = "tshark", parse(from_os_str))]
    decoder: PathBuf,

    /// Decoder timeout in seconds
    #[structopt(long = "decoder-timeout", default_value = "300")]
    decoder_timeout: u64,

    /// Additional TCP ports decoded as TLS (repeatable)
    #[structopt(long = "tls-port", number_of_values = 1)]
    tls_ports: Vec<u16>,

    /// Additional UDP ports treated as VXLAN (repeatable)
    #[structopt(long = "vxlan-port", number_of_values = 1)]
    vxlan_ports: Vec<u16>,

    /// Payload policy for TCP flows the analyzer never saw: zero or keep
    #[structopt(long = "unanalyzed", default_value = "zero")]
    unanalyzed: UnanalyzedPolicy,

    /// Keep the intermediate reassembled capture for debugging
    #[structopt(long = "keep-intermediate")]
    keep_intermediate: bool,

    /// Abort the batch at the first failing file
    #[structopt(long = "stop-on-error")]
    stop_on_error: bool,

    /// Number of files processed in parallel (default: one per core)
    #[structopt(short = "j", long = "jobs")]
    jobs: Option<usize>,

    /// Write the run report as JSON to this path
    #[structopt(long = "json-report", parse(from_os_str))]
    json_report: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = CliArgs::from_args();
    match run(args) {
        Ok(report) => {
            for line in report.summary_lines() {
                println!("{}", line);
            }
            if !report.all_succeeded() {
                process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            for cause in err.chain().skip(1) {
                eprintln!("  caused by: {}", cause);
            }
            process::exit(2);
        }
    }
}

fn run(args: CliArgs) -> Result<RunReport, Error> {
    // Configuration errors are fatal before any processing starts.
    if args.decoder_timeout == 0 {
        bail!("the decoder timeout must be at least one second");
    }
    if let Some(0) = args.jobs {
        bail!("the worker count must be at least one");
    }

    let inputs = discover_inputs(&args.inputs)?;
    if inputs.is_empty() {
        bail!("no capture files found in the given inputs");
    }
    for input in &inputs {
        if Some(args.output_dir.as_path()) == input.parent() {
            bail!(
                "output directory {} would overwrite input {}",
                args.output_dir.display(),
                input.display()
            );
        }
    }

    let mask_options = MaskOptions {
        reassemble: !args.no_reassembly,
        decoder_program: args.decoder,
        decoder_timeout: Duration::from_secs(args.decoder_timeout),
        extra_tls_ports: args.tls_ports,
        extra_vxlan_ports: args.vxlan_ports,
        policy: args.unanalyzed,
        keep_intermediate: args.keep_intermediate,
    };
    let batch_options = BatchOptions {
        stop_on_error: args.stop_on_error,
        jobs: args.jobs,
    };

    let pipeline = Pipeline::new(vec![Box::new(MaskStage::new(mask_options)) as Box<dyn Stage>]);
    let cancel = AtomicBool::new(false);
    let results = run_batch(
        &pipeline,
        &inputs,
        &args.output_dir,
        &batch_options,
        &LogSink,
        &cancel,
    )?;
    let report = RunReport::from_results(results);

    if let Some(path) = args.json_report {
        fs::write(&path, report.to_json()?)
            .with_context(|| format!("writing the report to {}", path.display()))?;
    }
    Ok(report)
}
