use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow as ah;
use anyhow::Context;
use env_logger::{Builder, Env};
use structopt::clap::ErrorKind;
use structopt::StructOpt;

use xmit_io::{
    archive::Archive,
    config::Config,
    dates,
    dump::{dump_json, DumpOptions},
    ebcdic::EbcdicCodec,
    text, Dataset, Member,
};

#[derive(StructOpt)]
#[structopt(
    name = "xmit-io",
    about = "A reader for z/OS TRANSMIT (XMI), AWSTAPE and HET container files."
)]
struct Opt {
    /// Input file (.xmi, .aws or .het; sniffed when the extension is absent)
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Strip the rightmost 8-column sequence number from fixed-80 text
    #[structopt(
        short = "u",
        long = "unnum",
        parse(try_from_str),
        default_value = "true"
    )]
    unnum: bool,

    /// Treat every stream as text
    #[structopt(short = "f", long = "force")]
    force: bool,

    /// Treat every stream as binary
    #[structopt(short = "b", long = "binary")]
    binary: bool,

    /// Only emit warnings and errors
    #[structopt(short = "q", long = "quiet")]
    quiet: bool,

    /// Print a human-readable listing
    #[structopt(short = "H", long = "human")]
    human: bool,

    /// Print the JSON projection to stdout
    #[structopt(short = "j", long = "json")]
    json: bool,

    /// Write the JSON projection to a file
    #[structopt(long = "jsonfile", parse(from_os_str))]
    jsonfile: Option<PathBuf>,

    /// Extract datasets and members below this directory
    #[structopt(long = "outputdir", parse(from_os_str))]
    outputdir: Option<PathBuf>,

    /// EBCDIC code page
    #[structopt(long = "encoding", default_value = "cp1140")]
    encoding: String,

    /// Override the logical record length reported by the container
    #[structopt(long = "lrecl")]
    lrecl: Option<usize>,

    /// Stamp extracted members with their ISPF modified date
    #[structopt(short = "m", long = "modify")]
    modify: bool,

    /// Print text-classified streams to stdout
    #[structopt(short = "p", long = "print")]
    print: bool,

    /// Per-record decode tracing
    #[structopt(short = "d", long = "debug")]
    debug: bool,
}

impl Opt {
    fn to_config(&self) -> Config {
        let mut config = Config::default();
        config.lrecl_override = self.lrecl;
        config.encoding = self.encoding.clone();
        config.unnum = self.unnum;
        config.force_text = self.force;
        config.binary_only = self.binary;
        config.preserve_modify_date = self.modify;
        config
    }
}

fn init_logger(opt: &Opt) {
    let default_level = if opt.debug {
        "debug"
    } else if opt.quiet {
        "warn"
    } else {
        "info"
    };
    let env = Env::default()
        .filter_or("XMIT_LOG_LEVEL", default_level)
        .write_style_or("XMIT_LOG_STYLE", "auto");

    let mut builder = Builder::from_env(env);
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} - {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

fn main() {
    let opt = match Opt::from_iter_safe(std::env::args()) {
        Ok(opt) => opt,
        Err(e)
            if e.kind == ErrorKind::HelpDisplayed || e.kind == ErrorKind::VersionDisplayed =>
        {
            println!("{}", e.message);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("{}", e.message);
            std::process::exit(2);
        }
    };

    init_logger(&opt);

    if let Err(e) = run(&opt) {
        log::error!(target: "xmit-io", "{:#}", e);
        std::process::exit(1);
    }
}

fn run(opt: &Opt) -> ah::Result<()> {
    let config = opt.to_config();
    let codec = EbcdicCodec::new(&config.encoding)?;

    let archive = Archive::open_file(&opt.input, &config)
        .with_context(|| format!("failed to decode {}", opt.input.display()))?;

    if opt.json || opt.jsonfile.is_some() {
        let value = dump_json(&archive, &config, &DumpOptions { text: opt.print });
        let rendered = serde_json::to_string_pretty(&value)?;
        if let Some(path) = &opt.jsonfile {
            fs::write(path, rendered.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
        } else {
            println!("{}", rendered);
        }
    }

    if opt.human || (!opt.json && !opt.print && opt.jsonfile.is_none()) {
        print_listing(&archive, &codec, &config);
    }

    if opt.print && !opt.json {
        print_text_streams(&archive, &codec, &config);
    }

    if let Some(outputdir) = &opt.outputdir {
        extract(&archive, outputdir, &codec, &config)?;
    }

    // Surface the abort cause after the partial state has been reported.
    archive.ok()?;
    Ok(())
}

fn print_listing(archive: &Archive, codec: &EbcdicCodec, config: &Config) {
    println!("{} archive: {}", archive.kind, summary_line(archive));
    if let Some(message) = &archive.message {
        println!("  message ({} bytes):", message.byte_len());
        for line in message.text(codec, config).lines() {
            println!("  | {}", line);
        }
    }
    for ds in &archive.datasets {
        let name = ds.name.as_deref().unwrap_or("(unnamed)");
        println!(
            "  {}  {}  {} lrecl={} blksize={} bytes={}",
            name, ds.org, ds.recfm, ds.lrecl, ds.blksize, ds.unloaded_bytes
        );
        for member in &ds.members {
            println!("    {}", member_line(member));
        }
    }
    for warning in &archive.warnings {
        println!("  warning: {}", warning);
    }
}

fn summary_line(archive: &Archive) -> String {
    let mut parts = Vec::new();
    if let Some(ts) = &archive.timestamp {
        parts.push(dates::iso_datetime(ts));
    }
    if let (Some(node), Some(user)) = (&archive.from_node, &archive.from_user) {
        parts.push(format!("from {}({})", node, user));
    }
    if let (Some(node), Some(user)) = (&archive.to_node, &archive.to_user) {
        parts.push(format!("to {}({})", node, user));
    }
    if let Some(volume) = &archive.volume {
        parts.push(format!("volume {}", volume.serial));
    }
    if parts.is_empty() {
        parts.push(format!("{} dataset(s)", archive.datasets.len()));
    }
    parts.join(", ")
}

fn member_line(member: &Member) -> String {
    let alias = if member.alias { " (alias)" } else { "" };
    match &member.ispf {
        Some(ispf) => {
            let modified = ispf
                .modified
                .as_ref()
                .map(dates::iso_datetime)
                .unwrap_or_default();
            format!(
                "{:<8}{} {:>8} bytes  {}  {}",
                member.name,
                alias,
                member.byte_len(),
                modified,
                ispf.owner
            )
        }
        None => format!("{:<8}{} {:>8} bytes", member.name, alias, member.byte_len()),
    }
}

fn print_text_streams(archive: &Archive, codec: &EbcdicCodec, config: &Config) {
    let mut streams: Vec<(String, String)> = Vec::new();
    if let Some(message) = &archive.message {
        streams.push(("MESSAGE".to_string(), message.text(codec, config)));
    }
    for ds in &archive.datasets {
        let name = ds.name.clone().unwrap_or_else(|| "(unnamed)".to_string());
        if ds.members.is_empty() {
            if ds.classify(codec, config).is_text() {
                streams.push((name, ds.text(codec, config)));
            }
        } else {
            for member in &ds.members {
                if ds.classify_member(member, codec, config).is_text() {
                    streams.push((
                        format!("{}({})", name, member.name),
                        ds.member_text(member, codec, config),
                    ));
                }
            }
        }
    }
    for (name, body) in streams {
        println!("----- {} -----", name);
        print!("{}", body);
    }
}

fn extract(
    archive: &Archive,
    outputdir: &Path,
    codec: &EbcdicCodec,
    config: &Config,
) -> ah::Result<()> {
    fs::create_dir_all(outputdir)
        .with_context(|| format!("failed to create {}", outputdir.display()))?;

    if let Some(message) = &archive.message {
        let path = outputdir.join("MESSAGE.txt");
        fs::write(&path, message.text(codec, config))?;
    }

    for (i, ds) in archive.datasets.iter().enumerate() {
        let name = ds
            .name
            .clone()
            .unwrap_or_else(|| format!("DATASET{:04}", i + 1));
        if ds.members.is_empty() {
            write_stream(&outputdir.join(&name), &ds.records, ds, None, codec, config)?;
        } else {
            let dir = outputdir.join(&name);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            for member in &ds.members {
                write_stream(
                    &dir.join(member.name.as_str()),
                    &member.records,
                    ds,
                    Some(member),
                    codec,
                    config,
                )?;
            }
        }
    }
    Ok(())
}

/// Write one terminal stream, appending an extension from the MIME guess and
/// optionally carrying the ISPF modified date onto the file.
fn write_stream(
    base: &Path,
    records: &[Vec<u8>],
    ds: &Dataset,
    member: Option<&Member>,
    codec: &EbcdicCodec,
    config: &Config,
) -> ah::Result<()> {
    let bytes = records.concat();
    let classification = text::classify(&bytes, &ds.recfm, ds.lrecl, codec, config);

    let path = if classification.is_text() {
        base.with_extension("txt")
    } else {
        let sample = &bytes[..bytes.len().min(4096)];
        let decoded = codec.decode(sample);
        match text::extension_for(text::sniff_mime(sample, &decoded)) {
            Some(ext) => base.with_extension(ext),
            None => base.to_path_buf(),
        }
    };

    if classification.is_text() {
        fs::write(
            &path,
            text::rendered(records, &ds.recfm, ds.lrecl, codec, config),
        )?;
    } else {
        fs::write(&path, &bytes)?;
    }
    log::info!(target: "xmit-io", "wrote {}", path.display());

    if config.preserve_modify_date {
        if let Some(modified) = member.and_then(|m| m.ispf.as_ref()).and_then(|s| s.modified) {
            let seconds = modified.timestamp();
            if seconds >= 0 {
                let mtime = UNIX_EPOCH + Duration::from_secs(seconds as u64);
                set_modified(&path, mtime)
                    .with_context(|| format!("failed to stamp {}", path.display()))?;
            }
        }
    }
    Ok(())
}

fn set_modified(path: &Path, mtime: SystemTime) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(mtime)
}
