//! Fixtures shared by the unit and integration tests: framework stubs,
//! interceptor types, target programs, and a recorder collecting the
//! interceptor events seen by the reference interpreter.
use std::{cell::RefCell, collections::HashSet, rc::Rc};

use loomir::{
    body::{ExceptionHandler, HandlerKind, Instr, InstrId, MethodBody},
    interp::{Interpreter, Value},
    program::{
        AttributeArg, CustomAttribute, FieldDef, FieldId, MethodDef, MethodId, MethodKind, Modifiers, ProgramUnit,
        TypeDef, TypeId, TypeKind,
    },
    types::Typeref,
};

use crate::magic;

pub const BUILDER_TYPE: &str = "System.Runtime.CompilerServices.AsyncTaskMethodBuilder";

/// Framework types every fixture program references.
pub struct Framework {
    pub object: TypeId,
    pub object_ctor: MethodId,
    pub exception: TypeId,
    pub interceptor_interface: TypeId,
    pub sync_root_interface: TypeId,
    pub assign_attribute: TypeId,
    pub assign_ctor: MethodId,
    pub ignore_attribute: TypeId,
    pub ignore_ctor: MethodId,
    pub task: TypeId,
    pub builder: TypeId,
    pub builder_ctor: MethodId,
    pub set_result: MethodId,
    pub set_exception: MethodId,
}

fn external_class(unit: &mut ProgramUnit, name: &str, base: Option<Typeref>) -> TypeId {
    let mut def = TypeDef::external(name, TypeKind::Class);
    def.base_type = base;
    unit.add_type(def).unwrap()
}

fn instance(name: &str, ret: Typeref) -> MethodDef {
    MethodDef::ordinary(name, ret).with_modifiers(Modifiers::PUBLIC | Modifiers::VIRTUAL)
}

pub fn framework(unit: &mut ProgramUnit) -> Framework {
    let object = external_class(unit, magic::OBJECT_TYPE, None);
    let object_ref = unit.type_ref(object).unwrap();
    let object_ctor = unit.add_method(object, MethodDef::constructor()).unwrap();
    let object_array = unit.registry.array(object_ref);

    let exception = external_class(unit, magic::EXCEPTION_TYPE, Some(object_ref));
    unit.add_method(exception, MethodDef::constructor()).unwrap();
    let exception_ref = unit.type_ref(exception).unwrap();
    for name in ["System.NullReferenceException", "System.InvalidCastException"] {
        let ty = external_class(unit, name, Some(exception_ref));
        unit.add_method(ty, MethodDef::constructor()).unwrap();
    }

    let system_type = external_class(unit, "System.Type", Some(object_ref));
    let system_type = unit.type_ref(system_type).unwrap();
    let method_base = external_class(unit, "System.Reflection.MethodBase", Some(object_ref));
    let method_base = unit.type_ref(method_base).unwrap();

    let interceptor_interface = unit
        .add_type(TypeDef::external(magic::METHOD_INTERCEPTOR_INTERFACE, TypeKind::Interface))
        .unwrap();
    let abstract_member = Modifiers::PUBLIC | Modifiers::VIRTUAL | Modifiers::ABSTRACT;
    unit.add_method(
        interceptor_interface,
        MethodDef::ordinary(magic::ON_ENTER, Typeref::VOID)
            .with_modifiers(abstract_member)
            .with_param("declaringType", system_type)
            .with_param("instance", object_ref)
            .with_param("methodbase", method_base)
            .with_param("values", object_array),
    )
    .unwrap();
    unit.add_method(
        interceptor_interface,
        MethodDef::ordinary(magic::ON_EXCEPTION, Typeref::BOOL)
            .with_modifiers(abstract_member)
            .with_param("e", exception_ref),
    )
    .unwrap();
    unit.add_method(
        interceptor_interface,
        MethodDef::ordinary(magic::ON_EXIT, Typeref::VOID).with_modifiers(abstract_member),
    )
    .unwrap();

    let sync_root_interface = unit
        .add_type(TypeDef::external(magic::SYNC_ROOT_INTERFACE, TypeKind::Interface))
        .unwrap();
    unit.add_method(
        sync_root_interface,
        MethodDef::new(magic::SYNC_ROOT_SETTER, MethodKind::PropertySetter, Typeref::VOID)
            .with_modifiers(abstract_member)
            .with_param("value", object_ref),
    )
    .unwrap();

    let assign_attribute = external_class(unit, magic::ASSIGN_FIELD_ATTRIBUTE, Some(object_ref));
    let string = unit.registry.named("System.String", false);
    let assign_ctor = unit
        .add_method(assign_attribute, MethodDef::constructor().with_param("value", string))
        .unwrap();
    let ignore_attribute = external_class(unit, magic::IGNORE_INTERCEPTION_ATTRIBUTE, Some(object_ref));
    let ignore_ctor = unit.add_method(ignore_attribute, MethodDef::constructor()).unwrap();

    let task = external_class(unit, "System.Threading.Tasks.Task", Some(object_ref));
    let builder = external_class(unit, BUILDER_TYPE, Some(object_ref));
    let builder_ctor = unit.add_method(builder, MethodDef::constructor()).unwrap();
    let set_result = unit.add_method(builder, instance("SetResult", Typeref::VOID)).unwrap();
    let set_exception = unit
        .add_method(builder, instance("SetException", Typeref::VOID).with_param("exception", exception_ref))
        .unwrap();

    Framework {
        object,
        object_ctor,
        exception,
        interceptor_interface,
        sync_root_interface,
        assign_attribute,
        assign_ctor,
        ignore_attribute,
        ignore_ctor,
        task,
        builder,
        builder_ctor,
        set_result,
        set_exception,
    }
}

/// An interceptor attribute type, defined in an interceptor library.
#[derive(Debug, Clone, Copy)]
pub struct Interceptor {
    pub ty: TypeId,
    pub ctor: MethodId,
}

impl Interceptor {
    pub fn attribute(&self) -> CustomAttribute {
        CustomAttribute::new(self.ty, self.ctor)
    }
}

/// Declare an interceptor attribute type; `sync_root` makes it implement the
/// synchronization root contract as well.
pub fn interceptor(unit: &mut ProgramUnit, fw: &Framework, name: &str, sync_root: bool) -> Interceptor {
    let object_ref = unit.type_ref(fw.object).unwrap();
    let mut def = TypeDef::external(name, TypeKind::Class)
        .with_base(object_ref)
        .with_interface(unit.type_ref(fw.interceptor_interface).unwrap());
    if sync_root {
        def = def.with_interface(unit.type_ref(fw.sync_root_interface).unwrap());
    }
    let ty = unit.add_type(def).unwrap();
    add_hooks(unit, fw, ty);
    if sync_root {
        unit.add_method(
            ty,
            MethodDef::new(magic::SYNC_ROOT_SETTER, MethodKind::PropertySetter, Typeref::VOID)
                .with_modifiers(Modifiers::PUBLIC | Modifiers::VIRTUAL)
                .with_param("value", object_ref),
        )
        .unwrap();
    }

    let ctor = unit.add_method(ty, MethodDef::constructor()).unwrap();
    Interceptor { ty, ctor }
}

/// Implement the three interceptor hooks on `ty`.
fn add_hooks(unit: &mut ProgramUnit, fw: &Framework, ty: TypeId) {
    let params: Vec<_> = unit
        .methods_of(fw.interceptor_interface)
        .map(|(_, m)| (m.name.clone(), m.return_type, m.params.clone()))
        .collect();
    for (name, ret, params) in params {
        let mut def = instance(&name, ret);
        def.params = params;
        unit.add_method(ty, def).unwrap();
    }
}

/// An interceptor inheriting every hook from `Demo.HookBase`1<T>`, closed
/// over `arg`. Returns the interceptor and the generic base.
pub fn derived_interceptor(unit: &mut ProgramUnit, fw: &Framework, name: &str, arg: Typeref) -> (Interceptor, TypeId) {
    let object_ref = unit.type_ref(fw.object).unwrap();
    let base = unit
        .add_type(
            TypeDef::external("Demo.HookBase`1", TypeKind::Class)
                .with_generic_params(["T"])
                .with_base(object_ref)
                .with_interface(unit.type_ref(fw.interceptor_interface).unwrap()),
        )
        .unwrap();
    add_hooks(unit, fw, base);

    let closed = unit.registry.instance(unit.type_ref(base).unwrap(), [arg]);
    let ty = unit
        .add_type(TypeDef::external(name, TypeKind::Class).with_base(closed))
        .unwrap();
    let ctor = unit.add_method(ty, MethodDef::constructor()).unwrap();
    (Interceptor { ty, ctor }, base)
}

/// An interceptor with one field tagged to receive `value`.
pub fn interceptor_with_binding(unit: &mut ProgramUnit, fw: &Framework, name: &str, value: &str) -> (TypeId, FieldId) {
    let interceptor = interceptor(unit, fw, name, false);
    let object_ref = unit.type_ref(fw.object).unwrap();
    let mut field = FieldDef::new("injected", object_ref, Modifiers::PUBLIC);
    field
        .attributes
        .push(CustomAttribute::new(fw.assign_attribute, fw.assign_ctor).with_arg(AttributeArg::Str(value.into())));
    let field = unit.add_field(interceptor.ty, field).unwrap();
    (interceptor.ty, field)
}

/// A user defined exception type with an empty constructor.
pub fn exception_type(unit: &mut ProgramUnit, fw: &Framework, name: &str) -> (TypeId, MethodId) {
    let base = unit.type_ref(fw.exception).unwrap();
    let ty = unit
        .add_type(TypeDef::new(name, TypeKind::Class).with_base(base))
        .unwrap();
    let (body, _) = MethodBody::from_instrs([Instr::Ret]);
    let ctor = unit.add_method(ty, MethodDef::constructor().with_body(body)).unwrap();
    (ty, ctor)
}

fn class(unit: &mut ProgramUnit, fw: &Framework, name: &str) -> TypeId {
    let base = unit.type_ref(fw.object).unwrap();
    unit.add_type(TypeDef::new(name, TypeKind::Class).with_base(base))
        .unwrap()
}

fn empty_ctor(unit: &mut ProgramUnit, ty: TypeId) -> MethodId {
    let (body, _) = MethodBody::from_instrs([Instr::Ret]);
    unit.add_method(ty, MethodDef::constructor().with_body(body)).unwrap()
}

/// Patch the jump at `jump` to land on `target`.
fn link(body: &mut MethodBody, jump: InstrId, target: InstrId) {
    let instr = body.get_mut(jump).unwrap();
    *instr = match instr {
        Instr::Br(_) => Instr::Br(target),
        Instr::BrTrue(_) => Instr::BrTrue(target),
        Instr::BrFalse(_) => Instr::BrFalse(target),
        Instr::Leave(_) => Instr::Leave(target),
        other => panic!("not a jump: {:?}", other),
    };
}

/// `if (value < 0) throw new Boom();` followed by `tail`, reading the
/// value from argument slot `arg`.
fn throw_when_negative(unit: &ProgramUnit, boom_ctor: MethodId, arg: u16, tail: &[Instr]) -> MethodBody {
    let boom = unit.method_ref(boom_ctor, None).unwrap();
    let mut body = MethodBody::new();
    body.push(Instr::LdArg(arg));
    body.push(Instr::LdcI4(0));
    body.push(Instr::Clt);
    let skip = body.push(Instr::BrFalse(InstrId::default()));
    body.push(Instr::NewObj(boom));
    body.push(Instr::Throw);
    let mut first = None;
    for instr in tail {
        let id = body.push(instr.clone());
        first.get_or_insert(id);
    }
    link(&mut body, skip, first.unwrap());
    body
}

/// `Demo.Foo::Bar(x)`: static, returns `x + 1`, throws `Demo.Boom` for a
/// negative `x`; tagged with `A` (no root needed) then `B` (needs the
/// synchronization root).
pub struct FooBar {
    pub unit: ProgramUnit,
    pub fw: Framework,
    pub a: Interceptor,
    pub b: Interceptor,
    pub boom: TypeId,
    pub foo: TypeId,
    pub bar: MethodId,
}

pub fn foo_bar() -> FooBar {
    let mut unit = ProgramUnit::new("Demo");
    let fw = framework(&mut unit);
    let a = interceptor(&mut unit, &fw, "Demo.A", false);
    let b = interceptor(&mut unit, &fw, "Demo.B", true);
    let (boom, boom_ctor) = exception_type(&mut unit, &fw, "Demo.Boom");

    let foo = class(&mut unit, &fw, "Demo.Foo");
    let body = throw_when_negative(
        &unit,
        boom_ctor,
        0,
        &[Instr::LdArg(0), Instr::LdcI4(1), Instr::Add, Instr::Ret],
    );
    let mut def = MethodDef::ordinary("Bar", Typeref::I32)
        .with_modifiers(Modifiers::PUBLIC | Modifiers::STATIC)
        .with_param("x", Typeref::I32)
        .with_body(body);
    def.attributes = vec![a.attribute(), b.attribute()];
    let bar = unit.add_method(foo, def).unwrap();

    FooBar {
        unit,
        fw,
        a,
        b,
        boom,
        foo,
        bar,
    }
}

/// `Demo.T` carrying `A` at type level, with two ordinary methods, a
/// constructor, a property getter and a method opting out of interception.
pub struct TypeWide {
    pub unit: ProgramUnit,
    pub fw: Framework,
    pub a: Interceptor,
    pub ty: TypeId,
    pub ctor: MethodId,
    pub m1: MethodId,
    pub m2: MethodId,
    pub getter: MethodId,
    pub ignored: MethodId,
}

pub fn type_wide() -> TypeWide {
    let mut unit = ProgramUnit::new("Demo");
    let fw = framework(&mut unit);
    let a = interceptor(&mut unit, &fw, "Demo.A", false);

    let ty = class(&mut unit, &fw, "Demo.T");
    unit.type_def_mut(ty).unwrap().attributes.push(a.attribute());
    let ctor = empty_ctor(&mut unit, ty);

    let (body, _) = MethodBody::from_instrs([Instr::Ret]);
    let m1 = unit
        .add_method(ty, MethodDef::ordinary("M1", Typeref::VOID).with_body(body))
        .unwrap();
    let (body, _) = MethodBody::from_instrs([Instr::LdArg(1), Instr::LdcI4(2), Instr::Add, Instr::Ret]);
    let m2 = unit
        .add_method(
            ty,
            MethodDef::ordinary("M2", Typeref::I32)
                .with_param("x", Typeref::I32)
                .with_body(body),
        )
        .unwrap();
    let (body, _) = MethodBody::from_instrs([Instr::LdcI4(7), Instr::Ret]);
    let getter = unit
        .add_method(
            ty,
            MethodDef::new("get_Value", MethodKind::PropertyGetter, Typeref::I32).with_body(body),
        )
        .unwrap();
    let (body, _) = MethodBody::from_instrs([Instr::Ret]);
    let mut skip = MethodDef::ordinary("Skip", Typeref::VOID).with_body(body);
    skip.attributes
        .push(CustomAttribute::new(fw.ignore_attribute, fw.ignore_ctor));
    let ignored = unit.add_method(ty, skip).unwrap();

    TypeWide {
        unit,
        fw,
        a,
        ty,
        ctor,
        m1,
        m2,
        getter,
        ignored,
    }
}

/// `Demo.Counter`: instance method `Add(i32)` tagged with `B`, a
/// constructor `.ctor(i32)` and a parameterless constructor delegating to
/// it.
pub struct Counter {
    pub unit: ProgramUnit,
    pub fw: Framework,
    pub b: Interceptor,
    pub ty: TypeId,
    pub value: FieldId,
    pub ctor_value: MethodId,
    pub ctor_default: MethodId,
    pub add: MethodId,
}

pub fn counter() -> Counter {
    let mut unit = ProgramUnit::new("Demo");
    let fw = framework(&mut unit);
    let b = interceptor(&mut unit, &fw, "Demo.B", true);

    let ty = class(&mut unit, &fw, "Demo.Counter");
    let value = unit
        .add_field(ty, FieldDef::new("value", Typeref::I32, Modifiers::PRIVATE))
        .unwrap();
    let value_ref = unit.field_ref(value, None).unwrap();

    let (body, _) = MethodBody::from_instrs([Instr::LdArg(0), Instr::LdArg(1), Instr::StFld(value_ref), Instr::Ret]);
    let ctor_value = unit
        .add_method(ty, MethodDef::constructor().with_param("start", Typeref::I32).with_body(body))
        .unwrap();
    let delegate = unit.method_ref(ctor_value, None).unwrap();
    let (body, _) = MethodBody::from_instrs([Instr::LdArg(0), Instr::LdcI4(10), Instr::Call(delegate), Instr::Ret]);
    let ctor_default = unit.add_method(ty, MethodDef::constructor().with_body(body)).unwrap();

    let (body, _) = MethodBody::from_instrs([
        Instr::LdArg(0),
        Instr::LdArg(0),
        Instr::LdFld(value_ref),
        Instr::LdArg(1),
        Instr::Add,
        Instr::StFld(value_ref),
        Instr::LdArg(0),
        Instr::LdFld(value_ref),
        Instr::Ret,
    ]);
    let mut def = MethodDef::ordinary("Add", Typeref::I32)
        .with_param("amount", Typeref::I32)
        .with_body(body);
    def.attributes.push(b.attribute());
    let add = unit.add_method(ty, def).unwrap();

    Counter {
        unit,
        fw,
        b,
        ty,
        value,
        ctor_value,
        ctor_default,
        add,
    }
}

/// `Demo.Service::FetchAsync(x)`, lowered into the state machine
/// `Demo.Service/<FetchAsync>d__2`. `MoveNext` calls `Work(x)`, which throws
/// `Demo.Boom` for a negative `x`, and completes the builder with
/// `SetResult` or `SetException`. The entry method is tagged with `A` then
/// `B`.
pub struct AsyncService {
    pub unit: ProgramUnit,
    pub fw: Framework,
    pub a: Interceptor,
    pub b: Interceptor,
    pub service: TypeId,
    pub service_ctor: MethodId,
    pub fetch: MethodId,
    pub machine: TypeId,
    pub move_next: MethodId,
    pub this_field: FieldId,
}

pub fn async_service() -> AsyncService {
    let mut unit = ProgramUnit::new("Demo");
    let fw = framework(&mut unit);
    let a = interceptor(&mut unit, &fw, "Demo.A", false);
    let b = interceptor(&mut unit, &fw, "Demo.B", true);
    let (_, boom_ctor) = exception_type(&mut unit, &fw, "Demo.Boom");

    let service = class(&mut unit, &fw, "Demo.Service");
    let service_ref = unit.type_ref(service).unwrap();
    let service_ctor = empty_ctor(&mut unit, service);
    let work_body = throw_when_negative(&unit, boom_ctor, 1, &[Instr::Ret]);
    let work = unit
        .add_method(
            service,
            MethodDef::ordinary("Work", Typeref::VOID)
                .with_param("x", Typeref::I32)
                .with_body(work_body),
        )
        .unwrap();

    let object_ref = unit.type_ref(fw.object).unwrap();
    let mut machine_def = TypeDef::new("Demo.Service/<FetchAsync>d__2", TypeKind::Class).with_base(object_ref);
    machine_def.modifiers = Modifiers::PRIVATE | Modifiers::SEALED | Modifiers::COMPILER_GENERATED;
    let machine = unit.add_type(machine_def).unwrap();
    let machine_ref = unit.type_ref(machine).unwrap();
    let builder_ref = unit.type_ref(fw.builder).unwrap();
    let exception_ref = unit.type_ref(fw.exception).unwrap();

    let this_field = unit
        .add_field(machine, FieldDef::new(magic::STATE_MACHINE_THIS_FIELD, service_ref, Modifiers::PUBLIC))
        .unwrap();
    let x_field = unit
        .add_field(machine, FieldDef::new("x", Typeref::I32, Modifiers::PUBLIC))
        .unwrap();
    let builder_field = unit
        .add_field(machine, FieldDef::new("<>t__builder", builder_ref, Modifiers::PUBLIC))
        .unwrap();
    let this_ref = unit.field_ref(this_field, None).unwrap();
    let x_ref = unit.field_ref(x_field, None).unwrap();
    let builder_field_ref = unit.field_ref(builder_field, None).unwrap();
    let machine_ctor = empty_ctor(&mut unit, machine);

    let work_ref = unit.method_ref(work, None).unwrap();
    let set_result = unit.method_ref(fw.set_result, None).unwrap();
    let set_exception = unit.method_ref(fw.set_exception, None).unwrap();

    let mut body = MethodBody::new();
    let ex = body.declare_local(exception_ref, Some("<>ex".into()));
    let try_start = body.push(Instr::LdArg(0));
    body.push(Instr::LdFld(this_ref));
    body.push(Instr::LdArg(0));
    body.push(Instr::LdFld(x_ref));
    body.push(Instr::CallVirt(work_ref));
    let leave_ok = body.push(Instr::Leave(InstrId::default()));
    let catch_start = body.push(Instr::StLoc(ex));
    body.push(Instr::LdArg(0));
    body.push(Instr::LdFld(builder_field_ref));
    body.push(Instr::LdLoc(ex));
    body.push(Instr::CallVirt(set_exception));
    let leave_fault = body.push(Instr::Leave(InstrId::default()));
    let end = body.push(Instr::LdArg(0));
    body.push(Instr::LdFld(builder_field_ref));
    body.push(Instr::CallVirt(set_result));
    let ret = body.push(Instr::Ret);
    link(&mut body, leave_ok, end);
    link(&mut body, leave_fault, ret);
    body.handlers.push(ExceptionHandler {
        kind: HandlerKind::Catch(exception_ref),
        try_start,
        try_end: catch_start,
        handler_start: catch_start,
        handler_end: Some(end),
    });
    let move_next = unit
        .add_method(
            machine,
            MethodDef::ordinary(loomir::program::MOVE_NEXT, Typeref::VOID)
                .with_modifiers(Modifiers::PRIVATE | Modifiers::VIRTUAL)
                .with_body(body),
        )
        .unwrap();

    let machine_ctor_ref = unit.method_ref(machine_ctor, None).unwrap();
    let builder_ctor_ref = unit.method_ref(fw.builder_ctor, None).unwrap();
    let move_next_ref = unit.method_ref(move_next, None).unwrap();
    let mut body = MethodBody::new();
    let sm = body.declare_local(machine_ref, Some("<>sm".into()));
    for instr in [
        Instr::NewObj(machine_ctor_ref),
        Instr::StLoc(sm),
        Instr::LdLoc(sm),
        Instr::LdArg(0),
        Instr::StFld(this_ref),
        Instr::LdLoc(sm),
        Instr::LdArg(1),
        Instr::StFld(x_ref),
        Instr::LdLoc(sm),
        Instr::NewObj(builder_ctor_ref),
        Instr::StFld(builder_field_ref),
        Instr::LdLoc(sm),
        Instr::CallVirt(move_next_ref),
        Instr::LdNull,
        Instr::Ret,
    ] {
        body.push(instr);
    }
    let task_ref = unit.type_ref(fw.task).unwrap();
    let mut def = MethodDef::ordinary("FetchAsync", task_ref)
        .with_param("x", Typeref::I32)
        .with_body(body);
    def.attributes = vec![a.attribute(), b.attribute()];
    def.async_state_machine = Some(machine);
    let fetch = unit.add_method(service, def).unwrap();
    unit.type_def_mut(machine).unwrap().state_machine_of = Some(fetch);

    AsyncService {
        unit,
        fw,
        a,
        b,
        service,
        service_ctor,
        fetch,
        machine,
        move_next,
        this_field,
    }
}

/// Collects interceptor and builder events seen by an [`Interpreter`].
#[derive(Clone, Default)]
pub struct Recorder {
    events: Rc<RefCell<Vec<String>>>,
    roots: Rc<RefCell<Vec<Value>>>,
    entered: Rc<RefCell<Vec<Vec<Value>>>>,
    handling: Rc<RefCell<HashSet<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the hooks of the interceptor type `type_name`; its events are
    /// recorded under the simple name (`Demo.A` records `A.OnEnter`, ...).
    pub fn install(&self, interp: &mut Interpreter<'_>, type_name: &str) {
        let short = type_name.rsplit('.').next().unwrap_or(type_name).to_string();

        let (events, entered, tag) = (self.events.clone(), self.entered.clone(), short.clone());
        interp.register_native(type_name, magic::ON_ENTER, move |_, args| {
            events.borrow_mut().push(format!("{}.OnEnter", tag));
            entered.borrow_mut().push(args.to_vec());
            Ok(Value::Null)
        });

        let (events, handling, tag) = (self.events.clone(), self.handling.clone(), short.clone());
        interp.register_native(type_name, magic::ON_EXCEPTION, move |_, _| {
            events.borrow_mut().push(format!("{}.OnException", tag));
            Ok(Value::bool(handling.borrow().contains(&tag)))
        });

        let (events, tag) = (self.events.clone(), short.clone());
        interp.register_native(type_name, magic::ON_EXIT, move |_, _| {
            events.borrow_mut().push(format!("{}.OnExit", tag));
            Ok(Value::Null)
        });

        let (events, roots, tag) = (self.events.clone(), self.roots.clone(), short);
        interp.register_native(type_name, magic::SYNC_ROOT_SETTER, move |_, args| {
            events.borrow_mut().push(format!("{}.SyncRoot", tag));
            roots.borrow_mut().push(args.get(1).cloned().unwrap_or(Value::Null));
            Ok(Value::Null)
        });
    }

    /// Record the completion calls of asynchronous methods.
    pub fn install_builder(&self, interp: &mut Interpreter<'_>) {
        for name in magic::ASYNC_COMPLETION_METHODS {
            let events = self.events.clone();
            interp.register_native(BUILDER_TYPE, name, move |_, _| {
                events.borrow_mut().push(name.to_string());
                Ok(Value::Null)
            });
        }
    }

    /// Make the interceptor with simple name `short` report exceptions as
    /// handled.
    pub fn handles(&self, short: &str) {
        self.handling.borrow_mut().insert(short.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
        self.roots.borrow_mut().clear();
        self.entered.borrow_mut().clear();
    }

    /// Roots handed to the synchronization root setters, in call order.
    pub fn roots(&self) -> Vec<Value> {
        self.roots.borrow().clone()
    }

    /// Arguments of every `OnEnter` call, `this` excluded.
    pub fn entered(&self) -> Vec<Vec<Value>> {
        self.entered
            .borrow()
            .iter()
            .map(|args| args.iter().skip(1).cloned().collect())
            .collect()
    }
}

