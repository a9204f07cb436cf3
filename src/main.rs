use anyhow::{bail, ensure, Context as _, Result};
use sftp_vfs::{
    auth::{CHOICE_CANCEL, CHOICE_LOG_IN},
    pipeline::MAX_REQUEST_LEN,
    AuthRequest, Authenticator, CancellationToken, Config, Credentials, Error, FileInfo,
    FileInfoFields, FileInfoOptions, FileType, FullAuthReply, OpenMode, Question, SetFileInfo,
    SftpVfs, Uri,
};
use std::{
    convert::Infallible,
    ffi::{OsStr, OsString},
    io::{self, prelude::*},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const USAGE: &str = "\
usage: sftp-vfs [options] <command> [args...]

commands:
    stat [-L] URI          show file information (-L follows links)
    ls URI                 list a directory
    cat URI                print a file
    get URI LOCAL          download a file
    put LOCAL URI          upload a file
    mkdir [-m MODE] URI    create a directory
    rmdir URI              remove a directory
    rm URI                 remove a file
    mv [-f] OLD NEW        move a file (-f replaces NEW)
    ln TARGET LINK         create a symbolic link
    chmod MODE URI         change permissions
    realpath URI           canonicalize a path

options:
    -u, --user NAME        login name when the URI has none
    --ssh PROGRAM          ssh client to run
    --request-size BYTES   length of one read/write request
    --max-outstanding N    requests in flight per transfer
    --prompt-timeout SECS  how long to wait during login
";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        print!("{}", USAGE);
        return Ok(());
    }

    let opts = Options::from_args(&mut args).context("Failed to parse command line arguments")?;
    let command = args.subcommand()?.context("missing command")?;
    tracing::debug!(?opts, %command);

    let vfs = SftpVfs::new(opts.config.clone(), Arc::new(Terminal));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("interrupted");
                cancel.cancel();
            }
        }
    });

    let res = run(&vfs, &opts, &command, args, &cancel).await;
    vfs.shutdown().await;
    res
}

#[derive(Debug)]
struct Options {
    config: Config,
    user: Option<String>,
}

impl Options {
    fn from_args(args: &mut pico_args::Arguments) -> Result<Self> {
        let mut config = Config::from_env();

        if let Some(program) = args.opt_value_from_os_str("--ssh", os_string)? {
            config.ssh_program = program;
        }
        if let Some(len) = args.opt_value_from_str("--request-size")? {
            config.request_len = len;
        }
        if let Some(n) = args.opt_value_from_str("--max-outstanding")? {
            config.max_outstanding = n;
        }
        if let Some(secs) = args.opt_value_from_str("--prompt-timeout")? {
            config.prompt_timeout = Duration::from_secs(secs);
        }
        ensure!(
            config.request_len > 0 && config.request_len <= MAX_REQUEST_LEN,
            "request size must be between 1 and {}",
            MAX_REQUEST_LEN
        );
        ensure!(config.max_outstanding > 0, "max outstanding must be positive");

        let user = args.opt_value_from_str(["-u", "--user"])?;

        Ok(Self { config, user })
    }

    fn uri(&self, args: &mut pico_args::Arguments) -> Result<Uri> {
        let s: String = args.free_from_str()?.context("missing URI")?;
        let uri = Uri::parse(&s).with_context(|| format!("invalid location: {}", s))?;
        Ok(match (&self.user, uri.user()) {
            (Some(user), None) => uri.with_user(user),
            _ => uri,
        })
    }
}

fn os_string(s: &OsStr) -> Result<OsString, Infallible> {
    Ok(s.to_owned())
}

fn parse_mode(s: &str) -> Result<u32> {
    u32::from_str_radix(s, 8).with_context(|| format!("invalid mode: {}", s))
}

async fn run(
    vfs: &SftpVfs,
    opts: &Options,
    command: &str,
    mut args: pico_args::Arguments,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        "stat" => {
            let options = if args.contains("-L") {
                FileInfoOptions::FOLLOW_LINKS
            } else {
                FileInfoOptions::empty()
            };
            let uri = opts.uri(&mut args)?;
            let info = vfs
                .get_file_info(&uri, options, cancel)
                .await
                .with_context(|| format!("failed to stat {}", uri))?;
            print_info(&info);
        }

        "ls" => {
            let uri = opts.uri(&mut args)?;
            let mut dir = vfs
                .open_directory(&uri, FileInfoOptions::empty(), cancel)
                .await
                .with_context(|| format!("failed to open directory {}", uri))?;
            let stdout = io::stdout();
            let mut stdout = stdout.lock();
            while let Some(info) = dir.read_next(cancel).await? {
                let link = match &info.symlink_name {
                    Some(target) => format!(" -> {}", target),
                    None => String::new(),
                };
                writeln!(
                    stdout,
                    "{} {:>10} {}{}",
                    mode_string(&info),
                    info.size,
                    info.name,
                    link
                )?;
            }
            dir.close().await?;
        }

        "cat" => {
            let uri = opts.uri(&mut args)?;
            let mut stdout = tokio::io::stdout();
            download(vfs, &uri, &mut stdout, cancel).await?;
        }

        "get" => {
            let uri = opts.uri(&mut args)?;
            let local: PathBuf = args.free_from_str()?.context("missing local path")?;
            let mut file = tokio::fs::File::create(&local)
                .await
                .with_context(|| format!("failed to create {}", local.display()))?;
            let n = download(vfs, &uri, &mut file, cancel).await?;
            tracing::info!(bytes = n, "downloaded");
        }

        "put" => {
            let local: PathBuf = args.free_from_str()?.context("missing local path")?;
            let uri = opts.uri(&mut args)?;
            let mut src = tokio::fs::File::open(&local)
                .await
                .with_context(|| format!("failed to open {}", local.display()))?;

            let mut dst = vfs
                .create(&uri, OpenMode::WRITE, false, 0o644, cancel)
                .await
                .with_context(|| format!("failed to create {}", uri))?;
            let mut buf = vec![0; vfs.config().io_block_size() as usize];
            let mut total = 0;
            loop {
                let n = src.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                dst.write(&buf[..n], cancel).await?;
                total += n;
            }
            dst.close().await?;
            tracing::info!(bytes = total, "uploaded");
        }

        "mkdir" => {
            let mode = match args.opt_value_from_str::<_, String>("-m")? {
                Some(mode) => parse_mode(&mode)?,
                None => 0o755,
            };
            let uri = opts.uri(&mut args)?;
            vfs.make_directory(&uri, mode, cancel)
                .await
                .with_context(|| format!("failed to create directory {}", uri))?;
        }

        "rmdir" => {
            let uri = opts.uri(&mut args)?;
            vfs.remove_directory(&uri, cancel)
                .await
                .with_context(|| format!("failed to remove directory {}", uri))?;
        }

        "rm" => {
            let uri = opts.uri(&mut args)?;
            vfs.unlink(&uri, cancel)
                .await
                .with_context(|| format!("failed to remove {}", uri))?;
        }

        "mv" => {
            let force = args.contains("-f");
            let old = opts.uri(&mut args)?;
            let new = opts.uri(&mut args)?;
            vfs.move_file(&old, &new, force, cancel)
                .await
                .with_context(|| format!("failed to move {} to {}", old, new))?;
        }

        "ln" => {
            let target: String = args.free_from_str()?.context("missing link target")?;
            let link = opts.uri(&mut args)?;
            vfs.create_symlink(&link, &target, cancel)
                .await
                .with_context(|| format!("failed to create symlink {}", link))?;
        }

        "chmod" => {
            let mode: String = args.free_from_str()?.context("missing mode")?;
            let uri = opts.uri(&mut args)?;
            let change = SetFileInfo {
                permissions: Some(parse_mode(&mode)?),
                ..SetFileInfo::default()
            };
            vfs.set_file_info(&uri, &change, cancel)
                .await
                .with_context(|| format!("failed to change mode of {}", uri))?;
        }

        "realpath" => {
            let uri = opts.uri(&mut args)?;
            let real = vfs
                .real_path(&uri, cancel)
                .await
                .with_context(|| format!("failed to resolve {}", uri))?;
            println!("{}", real);
        }

        command => bail!("unknown command: {}\n\n{}", command, USAGE),
    }

    args.finish()?;
    Ok(())
}

async fn download<W>(
    vfs: &SftpVfs,
    uri: &Uri,
    dst: &mut W,
    cancel: &CancellationToken,
) -> Result<usize>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut src = vfs
        .open(uri, OpenMode::READ, cancel)
        .await
        .with_context(|| format!("failed to open {}", uri))?;
    let mut buf = vec![0; vfs.config().io_block_size() as usize];
    let mut total = 0;
    loop {
        match src.read(&mut buf, cancel).await {
            Ok(n) => {
                dst.write_all(&buf[..n]).await?;
                total += n;
            }
            Err(Error::Eof) => break,
            Err(err) => return Err(err).with_context(|| format!("failed to read {}", uri)),
        }
    }
    dst.flush().await?;
    src.close().await?;
    Ok(total)
}

fn mode_string(info: &FileInfo) -> String {
    let typ = match info.file_type {
        FileType::Directory => 'd',
        FileType::SymbolicLink => 'l',
        FileType::CharacterDevice => 'c',
        FileType::BlockDevice => 'b',
        FileType::Fifo => 'p',
        FileType::Socket => 's',
        FileType::Regular | FileType::Unknown => '-',
    };
    let mut s = String::with_capacity(10);
    s.push(if info.is_symlink { 'l' } else { typ });
    for shift in [6, 3, 0] {
        let bits = (info.permissions >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}

fn print_info(info: &FileInfo) {
    println!("  Name: {}", info.name);
    if info.valid_fields.contains(FileInfoFields::TYPE) {
        println!("  Type: {:?}", info.file_type);
    }
    if info.valid_fields.contains(FileInfoFields::SIZE) {
        println!("  Size: {}", info.size);
    }
    if info.valid_fields.contains(FileInfoFields::PERMISSIONS) {
        println!(" Perms: {:04o} ({})", info.permissions, mode_string(info));
    }
    if info.valid_fields.contains(FileInfoFields::ATIME) {
        println!(" Atime: {}", info.atime);
    }
    if info.valid_fields.contains(FileInfoFields::MTIME) {
        println!(" Mtime: {}", info.mtime);
    }
    if let Some(target) = &info.symlink_name {
        println!("  Link: {}", target);
    }
    if let Some(mime_type) = info.mime_type {
        println!("  MIME: {}", mime_type);
    }
}

/// Asks on the controlling terminal.
struct Terminal;

impl Authenticator for Terminal {
    fn full_authentication(&self, request: &AuthRequest) -> FullAuthReply {
        let what = match (&request.object, &request.server) {
            (Some(key), _) => format!("passphrase for {}", key),
            (None, Some(server)) => format!("password for {}", server),
            (None, None) => "password".to_owned(),
        };
        if request.previous_attempt_failed {
            eprintln!("Authentication failed, try again.");
        }

        let mut username = request.username.clone();
        if request.need_username {
            match read_line(&format!("Username [{}]: ", whoami::username())) {
                Ok(name) if name.is_empty() => {}
                Ok(name) => username = Some(name),
                Err(..) => return FullAuthReply::Aborted,
            }
        }

        match read_secret(&format!("Enter {}: ", what)) {
            Ok(password) => FullAuthReply::Credentials(Credentials {
                username,
                password,
                keyring: None,
                save: false,
            }),
            Err(err) => {
                tracing::debug!(error = %err, "no answer");
                FullAuthReply::Aborted
            }
        }
    }

    fn question(&self, question: &Question) -> Option<usize> {
        eprintln!("{}", question.primary);
        eprintln!("{}", question.secondary);
        for (i, choice) in question.choices.iter().enumerate() {
            eprintln!("  [{}] {}", i, choice);
        }
        let hint = format!(
            "Choose [0 = {}, 1 = {}]: ",
            CHOICE_LOG_IN, CHOICE_CANCEL
        );
        read_line(&hint).ok()?.parse().ok()
    }
}

fn read_line(prompt: &str) -> io::Result<String> {
    eprint!("{}", prompt);
    io::stderr().flush()?;
    let mut line = String::new();
    if io::stdin().read_line(&mut line)? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(line.trim_end_matches(|c| c == '\n' || c == '\r').to_owned())
}

/// Read a line with echo turned off, if stdin is a terminal.
fn read_secret(prompt: &str) -> io::Result<String> {
    let fd = libc::STDIN_FILENO;
    let mut saved = unsafe { std::mem::zeroed::<libc::termios>() };
    let is_tty = unsafe { libc::tcgetattr(fd, &mut saved) } == 0;
    if is_tty {
        let mut quiet = saved;
        quiet.c_lflag &= !libc::ECHO;
        unsafe { libc::tcsetattr(fd, libc::TCSANOW, &quiet) };
    }

    let res = read_line(prompt);

    if is_tty {
        unsafe { libc::tcsetattr(fd, libc::TCSANOW, &saved) };
        eprintln!();
    }
    res
}
