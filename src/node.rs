use std::fmt::Debug;

use crate::{
    data::{DataId, ObjectType},
    device::{Device, DevicePtr, MarkerId, StreamId},
};

/// Direction of a kernel parameter. The discriminant indexes usage counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input = 0,
    Output = 1,
    Bidirectional = 2,
}

impl Direction {
    pub fn reads(&self) -> bool {
        *self != Direction::Output
    }

    pub fn writes(&self) -> bool {
        *self != Direction::Input
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    /// Optional parameters may be left unbound
    pub data: Option<DataId>,
    pub direction: Direction,
}

impl Param {
    pub fn input(data: DataId) -> Self {
        Self {
            data: Some(data),
            direction: Direction::Input,
        }
    }

    pub fn output(data: DataId) -> Self {
        Self {
            data: Some(data),
            direction: Direction::Output,
        }
    }

    pub fn bidirectional(data: DataId) -> Self {
        Self {
            data: Some(data),
            direction: Direction::Bidirectional,
        }
    }

    pub fn unbound(direction: Direction) -> Self {
        Self {
            data: None,
            direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    Success,
    /// The kernel has no device implementation
    NotImplemented,
    Failed(i32),
}

/// Where a kernel runs. Only device kernels can be fused into supernodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Target {
    #[default]
    Device,
    Host,
}

/// Resolved view of a bound parameter handed to a kernel at launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArg {
    pub data: DataId,
    pub object_type: ObjectType,
    /// `None` when the buffer is dropped from the argument list
    pub ptr: Option<DevicePtr>,
    pub offset: usize,
    pub size: usize,
    pub num_items: Option<usize>,
    pub direction: Direction,
}

pub struct LaunchArgs<'a> {
    pub device: &'a dyn Device,
    pub stream: StreamId,
    pub args: &'a [Option<KernelArg>],
}

impl LaunchArgs<'_> {
    pub fn arg(&self, index: usize) -> Option<&KernelArg> {
        self.args.get(index).and_then(Option::as_ref)
    }
}

/// Per-kernel device code. Enqueues work on `args.stream` and returns without waiting.
pub trait Kernel: Debug {
    fn name(&self) -> &str;

    fn target(&self) -> Target {
        Target::Device
    }

    fn execute(&mut self, args: &LaunchArgs) -> KernelStatus;

    /// Source text of the generated device kernel, if any
    fn device_code(&self) -> Option<&str> {
        None
    }
}

/// Kernel backed by a closure
pub struct FnKernel<F> {
    name: String,
    target: Target,
    code: Option<String>,
    f: F,
}

impl<F: FnMut(&LaunchArgs) -> KernelStatus> FnKernel<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            target: Target::Device,
            code: None,
            f,
        }
    }

    pub fn on_host(mut self) -> Self {
        self.target = Target::Host;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl<F> Debug for FnKernel<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnKernel({})", self.name)
    }
}

impl<F: FnMut(&LaunchArgs) -> KernelStatus> Kernel for FnKernel<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> Target {
        self.target
    }

    fn execute(&mut self, args: &LaunchArgs) -> KernelStatus {
        (self.f)(args)
    }

    fn device_code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaunchState {
    #[default]
    Idle,
    Launched,
    Completed,
}

/// Kernel invocation with bound parameters
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub kernel: Box<dyn Kernel>,
    pub params: Vec<Param>,
    pub hierarchical_level: u32,
    /// Start and stop markers, created on first launch
    pub markers: Option<(MarkerId, MarkerId)>,
    pub state: LaunchState,
    /// Supernode this node was merged into
    pub supernode: Option<usize>,
}

impl Node {
    pub fn new(kernel: impl Kernel + 'static, params: Vec<Param>) -> Self {
        Self {
            name: kernel.name().to_string(),
            kernel: Box::new(kernel),
            params,
            hierarchical_level: 0,
            markers: None,
            state: LaunchState::Idle,
            supernode: None,
        }
    }

    /// Bound parameters with their directions
    pub fn bound(&self) -> impl Iterator<Item = (DataId, Direction)> + '_ {
        self.params
            .iter()
            .filter_map(|p| p.data.map(|d| (d, p.direction)))
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
