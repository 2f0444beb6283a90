use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Subscribe/unsubscribe wait deadline, e.g. "60s"
    #[structopt(name = "task-timeout", long)]
    pub task_timeout: Option<String>,
}
