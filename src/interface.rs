use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum InterfaceMode {
    /// VIAFLO remote-control protocol over a serial port
    #[default]
    Serial,
    /// Simulated pipettes, debug builds only
    Simulation,
}

impl InterfaceMode {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Serial => "LIVE",
            Self::Simulation => "SIM",
        }
    }
}
