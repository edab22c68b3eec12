pub mod demo;
pub mod genconfig;
pub mod validate;

pub trait Command {
    fn run(self) -> anyhow::Result<()>;
}
