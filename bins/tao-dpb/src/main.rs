//! tao-dpb - H.264 DPB 追踪工具
//!
//! 读取 slice 头回放脚本, 以合成宏块流水线驱动调度器,
//! 输出每个 slice 之后的缓冲状态与最终的图像输出顺序 (JSON).

mod logging;
mod replay;
mod script;

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tao_h264::DecoderConfig;

use replay::ReplayOptions;
use script::Script;

#[derive(Parser, Debug)]
#[command(name = "tao-dpb", version, about = "H.264 DPB 状态追踪工具")]
struct Cli {
    /// 回放脚本路径 (JSON)
    script: PathBuf,

    /// 工作线程数 (0 = 同步执行)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// slice 任务池容量
    #[arg(long = "task-slots")]
    task_slots: Option<usize>,

    /// 准入点不阻塞, 资源不足时由工具重试
    #[arg(long = "non-blocking")]
    non_blocking: bool,

    /// 报告中包含每一步的完整槽位快照
    #[arg(long)]
    trace: bool,

    /// 报告输出文件, 缺省写到标准输出
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 日志文件目录, 指定后按天滚动写入
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,

    /// 日志级别 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// 配置优先级: 命令行 > 环境变量 > 脚本 > 默认值
    fn decoder_config(&self, script: &Script) -> DecoderConfig {
        let mut config = script
            .config
            .clone()
            .unwrap_or_default()
            .with_env_overrides();
        if let Some(threads) = self.threads {
            config.worker_threads = threads;
        }
        if let Some(slots) = self.task_slots {
            config.task_slots = slots;
        }
        if self.non_blocking {
            config.non_blocking = true;
        }
        config
    }
}

fn run(cli: &Cli) -> Result<()> {
    let script = Script::load(&cli.script)?;
    let options = ReplayOptions {
        config: Some(cli.decoder_config(&script)),
        trace: cli.trace,
    };
    let report = replay::run(&script, &options)?;
    let json = serde_json::to_string_pretty(&report).context("序列化报告失败")?;
    match &cli.output {
        Some(path) => std::fs::write(path, json + "\n")
            .with_context(|| format!("写入报告失败: {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = logging::init("tao-dpb", cli.verbose, cli.log_dir.as_deref()) {
        eprintln!("警告: 日志初始化失败: {e:#}");
    }

    if let Err(e) = run(&cli) {
        eprintln!("错误: {e:#}");
        process::exit(1);
    }
}
