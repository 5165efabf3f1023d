//! Stub implementations of the whitelisted SDK modules
//!
//! Each stub is a Lua chunk evaluated inside the sandbox VM. The `restate` stub
//! receives a recorder function and reports every service definition to it; the
//! `workflow-sdk` helpers are inert.

/// Chunk arguments: `(record, version)`
pub const RESTATE_STUB: &str = r#"
local record, version = ...

local function define(kind)
  return function(definition)
    if type(definition) ~= "table" then
      error(kind .. " definition must be a table", 2)
    end
    local name = definition.name
    if type(name) ~= "string" or name == "" then
      error(kind .. " definition requires a non-empty string name", 2)
    end
    record(kind, name)
    return { kind = kind, name = name, handlers = definition.handlers or {} }
  end
end

local function endpoint()
  local bound = {}
  local ep = {}

  function ep:bind(definition)
    if type(definition) ~= "table" or definition.kind == nil then
      error("endpoint can only bind service definitions", 2)
    end
    bound[#bound + 1] = definition
    return self
  end

  function ep:handler()
    return function(request)
      for _, definition in ipairs(bound) do
        local handler = definition.handlers[request.handler]
        if definition.name == request.service and handler ~= nil then
          return handler(request.context, request.input)
        end
      end
      error("no bound handler for " .. tostring(request.service), 2)
    end
  end

  function ep:listen()
    return self
  end

  return ep
end

return {
  VERSION = version,
  service = define("service"),
  workflow = define("workflow"),
  object = define("object"),
  endpoint = endpoint,
}
"#;

/// Chunk arguments: `(version)`
pub const WORKFLOW_SDK_STUB: &str = r#"
local version = ...
local sdk = { VERSION = version }

function sdk.sleep(ctx, millis)
  return nil
end

function sdk.state(ctx)
  local store = {}
  return {
    get = function(_, key) return store[key] end,
    set = function(_, key, value) store[key] = value end,
  }
end

function sdk.promise(ctx, name)
  return {
    resolve = function() end,
    await = function() return nil end,
  }
end

return sdk
"#;

/// Stubbed module names; a whitelisted name without a stub still cannot resolve
pub fn has_stub(module: &str) -> bool {
    matches!(module, "restate" | "workflow-sdk")
}
