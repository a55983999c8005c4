use skein_scripting::FrameTime;

/// Update order slots of the host loop; lower runs first
pub mod update_order {
    pub const INPUT: i32 = -200;
    pub const SCRIPTS: i32 = -100;
    pub const ENTITIES: i32 = 0;
    pub const CAMERA: i32 = 100;
    pub const AUDIO: i32 = 200;
    pub const UI: i32 = 300;
}

/// A system updated once per frame by the [`Simulation`](crate::Simulation)
///
/// Systems run in ascending [`update_order`](GameSystem::update_order); the
/// script system always runs in the [`update_order::SCRIPTS`] slot.
pub trait GameSystem: 'static {
    fn name(&self) -> &str;

    fn update_order(&self) -> i32 {
        update_order::ENTITIES
    }

    fn update(&mut self, time: &FrameTime) -> anyhow::Result<()>;
}

/// Adapts a closure into a [`GameSystem`]
pub struct FnSystem<F> {
    name: String,
    order: i32,
    update: F,
}

impl<F> FnSystem<F>
where
    F: FnMut(&FrameTime) -> anyhow::Result<()> + 'static,
{
    pub fn new(name: impl Into<String>, order: i32, update: F) -> Self {
        Self {
            name: name.into(),
            order,
            update,
        }
    }
}

impl<F> GameSystem for FnSystem<F>
where
    F: FnMut(&FrameTime) -> anyhow::Result<()> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn update_order(&self) -> i32 {
        self.order
    }

    fn update(&mut self, time: &FrameTime) -> anyhow::Result<()> {
        (self.update)(time)
    }
}

impl<F> std::fmt::Debug for FnSystem<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSystem")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish()
    }
}
