use std::path::PathBuf;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Handle;

pub fn init_logging(log_fp: Option<&PathBuf>) -> Handle {
    let level = LevelFilter::Info;
    let console_appender = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{h({l})} {m}{n}")))
        .build();

    let mut config =
        Config::builder().appender(Appender::builder().build(
            "stderr",
            Box::new(console_appender),
        ));
    let mut root = Root::builder().appender("stderr");

    if let Some(fp) = log_fp {
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(
                "[{f}::{L}][{d(%Y-%m-%d %H:%M:%S)}][{l}] {m}{n}",
            )))
            .build(fp)
            .expect("failed to make log file appender");
        config = config
            .appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }

    let config = config
        .build(root.build(level))
        .expect("failed to build logging config");

    log4rs::init_config(config).expect("failed to init logging")
}
